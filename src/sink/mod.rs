//! Upsert target for fetched pages.
//!
//! Persistence technology for synchronized entities is a collaborator, not
//! part of the engine; the engine only needs upsert semantics keyed by the
//! platform's item id so that re-fetching a page after a crash converges to
//! the same state.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::cursor::EntityType;
use crate::error::{Result, SyncError};

#[async_trait]
pub trait EntitySink: Send + Sync {
    /// Upsert one page of items for (account, entity type). Items are keyed by
    /// their `id` field; an item without an id is an invariant violation.
    async fn upsert(&self, account_id: &str, entity_type: EntityType, items: &[Value])
        -> Result<()>;
}

/// In-process sink over a concurrent map. Production deployments swap in a
/// durable implementation; tests inspect it directly.
#[derive(Default)]
pub struct MemoryEntitySink {
    entities: DashMap<(String, EntityType, String), Value>,
}

impl MemoryEntitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account_id: &str, entity_type: EntityType, item_id: &str) -> Option<Value> {
        self.entities
            .get(&(account_id.to_string(), entity_type, item_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn count(&self, account_id: &str, entity_type: EntityType) -> usize {
        self.entities
            .iter()
            .filter(|entry| {
                let (account, entity, _) = entry.key();
                account == account_id && *entity == entity_type
            })
            .count()
    }
}

#[async_trait]
impl EntitySink for MemoryEntitySink {
    async fn upsert(
        &self,
        account_id: &str,
        entity_type: EntityType,
        items: &[Value],
    ) -> Result<()> {
        for item in items {
            let id = item
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    SyncError::Invariant(format!(
                        "{} item without id for account {account_id}",
                        entity_type.as_str()
                    ))
                })?
                .to_string();
            self.entities
                .insert((account_id.to_string(), entity_type, id), item.clone());
        }
        Ok(())
    }
}
