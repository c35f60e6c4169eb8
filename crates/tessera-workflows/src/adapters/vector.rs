//! Vector index port
//!
//! Point ids follow the convention `{document_id}:{chunk_index}`, so a
//! delete addressed with a bare document id removes every chunk of that
//! document. Upserts are idempotent by point id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::AdapterError;

/// A point to upsert.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotent upsert by point id.
    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<(), AdapterError>;

    /// Ranked nearest-neighbour search.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredPoint>, AdapterError>;

    /// Delete by id. A bare document id deletes all of its chunk points.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), AdapterError>;
}

/// In-memory vector index with cosine ranking and scripted failures.
#[derive(Default)]
pub struct MemoryVectorIndex {
    collections: RwLock<HashMap<String, HashMap<String, VectorPoint>>>,
    fail_upserts: AtomicU32,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upserts fail transiently (test helper).
    pub fn fail_next_upserts(&self, n: u32) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }

    /// Number of points in a collection (test helper).
    pub fn point_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|points| points.len())
            .unwrap_or(0)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<(), AdapterError> {
        let pending = self.fail_upserts.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_upserts
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(AdapterError::Transient("vector index unavailable".into()));
        }

        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(point.id.clone(), point);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredPoint>, AdapterError> {
        let collections = self.collections.read();
        let Some(points) = collections.get(collection) else {
            return Ok(vec![]);
        };

        let mut scored: Vec<ScoredPoint> = points
            .values()
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine(&p.vector, vector),
                metadata: p.metadata.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AdapterError> {
        let mut collections = self.collections.write();
        if let Some(points) = collections.get_mut(collection) {
            let prefix = format!("{id}:");
            points.retain(|point_id, _| point_id != id && !point_id.starts_with(&prefix));
        }
        Ok(())
    }
}
