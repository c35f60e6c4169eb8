//! Activity library
//!
//! Idempotent units of work executed by the worker fleet. Every external
//! write goes through an adapter port under a deterministic key
//! (`(tenant, document_id)` or `(tenant, question_id)`) with upsert
//! semantics, so re-execution after a retry produces a single effect.

pub mod answer;
pub mod ingest;
pub mod review;
