//! Pre-key deletion validation
//!
//! Deleting a pre-key that is no longer stored would let a cache and its
//! backing store drift apart, so deletions are checked against an existence
//! source first and dropped when the id is absent. Outside a transaction the
//! source is the backing store; inside one it is the transaction's cache.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use tessera_core::storage::{CategoryData, KeyCategory, KeyStore, KeyValue};

use crate::mutex::KeyedMutex;

/// Drops deletions of ids that do not exist
pub struct PreKeyDeletionValidator {
    store: Arc<dyn KeyStore>,
    queues: KeyedMutex,
}

impl PreKeyDeletionValidator {
    /// Validate against `store`
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            queues: KeyedMutex::new(),
        }
    }

    /// Remove deletions of ids missing from the backing store.
    ///
    /// Runs serialized per category. Returns the number of dropped deletions.
    pub async fn validate_deletions(
        &self,
        category: KeyCategory,
        data: &mut CategoryData,
    ) -> tessera_core::Result<usize> {
        let deletions: Vec<String> = data
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if deletions.is_empty() {
            return Ok(0);
        }

        let _guard = self.queues.lock(category.as_str()).await;
        let existing = self.store.get(category, &deletions).await?;

        let mut dropped = 0;
        for id in deletions {
            if !existing.contains_key(&id) {
                warn!("Skipping deletion of non-existent {}: {}", category, id);
                data.remove(&id);
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Remove deletions of ids the transaction cache does not hold a value for
    pub fn filter_in_transaction(
        category: KeyCategory,
        mut data: CategoryData,
        cache: Option<&HashMap<String, Option<KeyValue>>>,
    ) -> CategoryData {
        data.retain(|id, value| {
            if value.is_some() {
                return true;
            }
            let present = cache
                .and_then(|cached| cached.get(id))
                .is_some_and(|v| v.is_some());
            if !present {
                warn!(
                    "Skipping deletion of non-existent {} in transaction: {}",
                    category, id
                );
            }
            present
        });
        data
    }
}
