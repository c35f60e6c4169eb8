//! Graph store port
//!
//! Writes use MERGE semantics keyed by node/edge id, so re-running an upsert
//! after a retry leaves a single copy of each entity and relation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::AdapterError;

/// A node extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// A typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelation {
    pub from: String,
    pub to: String,
    pub kind: String,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// MERGE entities and relations for a document.
    async fn merge_document(
        &self,
        tenant: &str,
        document_id: &str,
        entities: &[GraphEntity],
        relations: &[GraphRelation],
    ) -> Result<(), AdapterError>;

    /// Entities adjacent to a seed node.
    async fn neighbors(
        &self,
        tenant: &str,
        node_id: &str,
        limit: usize,
    ) -> Result<Vec<GraphEntity>, AdapterError>;

    /// Remove everything written for a document.
    async fn delete_document(&self, tenant: &str, document_id: &str) -> Result<(), AdapterError>;
}

#[derive(Default)]
struct TenantGraph {
    /// entity id → (entity, owning documents)
    entities: HashMap<String, (GraphEntity, Vec<String>)>,
    relations: Vec<(GraphRelation, String)>,
}

/// In-memory graph store with scripted failures.
#[derive(Default)]
pub struct MemoryGraphStore {
    tenants: RwLock<HashMap<String, TenantGraph>>,
    fail_merges: AtomicU32,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` merges fail transiently (test helper).
    pub fn fail_next_merges(&self, n: u32) {
        self.fail_merges.store(n, Ordering::SeqCst);
    }

    /// Number of entities for a tenant (test helper).
    pub fn entity_count(&self, tenant: &str) -> usize {
        self.tenants
            .read()
            .get(tenant)
            .map(|g| g.entities.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn merge_document(
        &self,
        tenant: &str,
        document_id: &str,
        entities: &[GraphEntity],
        relations: &[GraphRelation],
    ) -> Result<(), AdapterError> {
        let pending = self.fail_merges.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_merges
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(AdapterError::Transient("graph store unavailable".into()));
        }

        let mut tenants = self.tenants.write();
        let graph = tenants.entry(tenant.to_string()).or_default();

        for entity in entities {
            let (stored, owners) = graph
                .entities
                .entry(entity.id.clone())
                .or_insert_with(|| (entity.clone(), vec![]));
            *stored = entity.clone();
            if !owners.iter().any(|d| d == document_id) {
                owners.push(document_id.to_string());
            }
        }

        for relation in relations {
            let exists = graph
                .relations
                .iter()
                .any(|(r, d)| r == relation && d == document_id);
            if !exists {
                graph
                    .relations
                    .push((relation.clone(), document_id.to_string()));
            }
        }

        Ok(())
    }

    async fn neighbors(
        &self,
        tenant: &str,
        node_id: &str,
        limit: usize,
    ) -> Result<Vec<GraphEntity>, AdapterError> {
        let tenants = self.tenants.read();
        let Some(graph) = tenants.get(tenant) else {
            return Ok(vec![]);
        };

        let mut neighbor_ids: Vec<&str> = graph
            .relations
            .iter()
            .filter_map(|(r, _)| {
                if r.from == node_id {
                    Some(r.to.as_str())
                } else if r.to == node_id {
                    Some(r.from.as_str())
                } else {
                    None
                }
            })
            .collect();
        neighbor_ids.sort();
        neighbor_ids.dedup();

        Ok(neighbor_ids
            .into_iter()
            .filter_map(|id| graph.entities.get(id).map(|(e, _)| e.clone()))
            .take(limit)
            .collect())
    }

    async fn delete_document(&self, tenant: &str, document_id: &str) -> Result<(), AdapterError> {
        let mut tenants = self.tenants.write();
        let Some(graph) = tenants.get_mut(tenant) else {
            return Ok(());
        };

        graph.relations.retain(|(_, d)| d != document_id);
        graph.entities.retain(|_, (_, owners)| {
            owners.retain(|d| d != document_id);
            !owners.is_empty()
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str) -> GraphEntity {
        GraphEntity {
            id: id.to_string(),
            label: "Topic".to_string(),
            properties: json!({}),
        }
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = MemoryGraphStore::new();
        let entities = vec![entity("rust"), entity("tokio")];
        let relations = vec![GraphRelation {
            from: "rust".into(),
            to: "tokio".into(),
            kind: "mentions".into(),
        }];

        store
            .merge_document("t", "d1", &entities, &relations)
            .await
            .unwrap();
        store
            .merge_document("t", "d1", &entities, &relations)
            .await
            .unwrap();

        assert_eq!(store.entity_count("t"), 2);
    }

    #[tokio::test]
    async fn test_neighbors() {
        let store = MemoryGraphStore::new();
        store
            .merge_document(
                "t",
                "d1",
                &[entity("rust"), entity("tokio"), entity("serde")],
                &[
                    GraphRelation {
                        from: "rust".into(),
                        to: "tokio".into(),
                        kind: "mentions".into(),
                    },
                    GraphRelation {
                        from: "serde".into(),
                        to: "rust".into(),
                        kind: "mentions".into(),
                    },
                ],
            )
            .await
            .unwrap();

        let neighbors = store.neighbors("t", "rust", 10).await.unwrap();
        let ids: Vec<_> = neighbors.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["serde", "tokio"]);
    }

    #[tokio::test]
    async fn test_delete_document_keeps_shared_entities() {
        let store = MemoryGraphStore::new();
        store
            .merge_document("t", "d1", &[entity("rust")], &[])
            .await
            .unwrap();
        store
            .merge_document("t", "d2", &[entity("rust"), entity("tokio")], &[])
            .await
            .unwrap();

        store.delete_document("t", "d1").await.unwrap();

        // rust is still owned by d2.
        assert_eq!(store.entity_count("t"), 2);

        store.delete_document("t", "d2").await.unwrap();
        assert_eq!(store.entity_count("t"), 0);
    }

    #[tokio::test]
    async fn test_scripted_merge_failures() {
        let store = MemoryGraphStore::new();
        store.fail_next_merges(1);

        assert!(store.merge_document("t", "d1", &[], &[]).await.is_err());
        assert!(store.merge_document("t", "d1", &[], &[]).await.is_ok());
    }
}
