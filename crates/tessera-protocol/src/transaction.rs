//! Transactional key store
//!
//! [`TransactionalKeyStore`] wraps a raw [`KeyStore`] and adds:
//!
//! - **Transactions**: `transaction(lock_key, work)` runs `work` under a
//!   per-lock-key mutex with a fresh context. Reads inside the context are
//!   served from its cache, writes accumulate in it, and the accumulated
//!   mutation set is committed with bounded retry once `work` succeeds. A
//!   failing `work` discards the context and leaves the store untouched.
//! - **Flattened nesting**: a transaction started while one is already active
//!   for the same store joins it; the outermost call owns the commit.
//!   Transactions on different stores nest independently.
//! - **Commit hooks**: [`TransactionalKeyStore::after_commit`] defers in-memory
//!   side effects until the outermost commit lands, and drops them on rollback.
//! - **Per-category write queues**: outside a transaction each category's
//!   write is applied through its own FIFO queue.
//! - **Pre-key deletion validation** on every write path.
//!
//! The active context travels with the task through a `tokio` task-local, so
//! work spawned onto other tasks does not inherit it.

use futures::future::try_join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

use async_trait::async_trait;
use tessera_core::storage::{mutation_count, KeyCategory, KeyStore, KeyValue, Mutations};

use crate::config::TransactionConfig;
use crate::mutex::KeyedMutex;
use crate::prekey::PreKeyDeletionValidator;

static NEXT_STORE_ID: AtomicUsize = AtomicUsize::new(1);

/// Open transactions of the current task, by store id
type ActiveScopes = HashMap<usize, Arc<TransactionScope>>;

tokio::task_local! {
    static ACTIVE_TRANSACTIONS: Arc<ActiveScopes>;
}

type CommitHook = Box<dyn FnOnce() + Send>;

/// Live state of one transaction
struct TransactionScope {
    store_id: usize,
    state: Mutex<TransactionState>,
}

#[derive(Default)]
struct TransactionState {
    /// Values read or written so far. `None` is a known-absent id.
    cache: HashMap<KeyCategory, HashMap<String, Option<KeyValue>>>,
    mutations: Mutations,
    db_queries: usize,
    after_commit: Vec<CommitHook>,
}

/// Key store with transactions, write queues and pre-key validation
pub struct TransactionalKeyStore {
    id: usize,
    store: Arc<dyn KeyStore>,
    config: TransactionConfig,
    /// Serializes transactions per lock key
    tx_locks: KeyedMutex,
    /// Serializes in-transaction backing-store reads per category
    fetch_locks: KeyedMutex,
    /// One in-flight write per category outside transactions
    write_queues: KeyedMutex,
    prekeys: PreKeyDeletionValidator,
}

impl TransactionalKeyStore {
    /// Wrap `store`
    pub fn new(store: Arc<dyn KeyStore>, config: TransactionConfig) -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            prekeys: PreKeyDeletionValidator::new(store.clone()),
            store,
            config,
            tx_locks: KeyedMutex::new(),
            fetch_locks: KeyedMutex::new(),
            write_queues: KeyedMutex::new(),
        }
    }

    /// Commit configuration
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// The current task is inside a transaction on this store
    pub fn is_in_transaction(&self) -> bool {
        self.current_scope().is_some()
    }

    fn current_scope(&self) -> Option<Arc<TransactionScope>> {
        ACTIVE_TRANSACTIONS
            .try_with(|scopes| scopes.get(&self.id).cloned())
            .ok()
            .flatten()
    }

    /// Run `hook` once the current transaction has committed.
    ///
    /// Outside a transaction `hook` runs immediately. Hooks of a transaction
    /// that rolls back or fails to commit never run.
    pub fn after_commit<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.current_scope() {
            Some(scope) => scope.state.lock().after_commit.push(Box::new(hook)),
            None => hook(),
        }
    }

    /// Run `work` as one transaction serialized under `lock_key`.
    ///
    /// Mutations made through this store while `work` runs are committed
    /// together after it returns `Ok`. When already inside a transaction,
    /// `work` joins it and nothing is committed here.
    pub async fn transaction<T, E, F, Fut>(&self, lock_key: &str, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<tessera_core::Error>,
    {
        if self.is_in_transaction() {
            trace!("Reusing existing transaction context");
            return work().await;
        }

        let _guard = self.tx_locks.lock(lock_key).await;
        let scope = Arc::new(TransactionScope {
            store_id: self.id,
            state: Mutex::new(TransactionState::default()),
        });
        trace!(lock_key, "Entering transaction");

        let mut scopes = ACTIVE_TRANSACTIONS
            .try_with(|scopes| ActiveScopes::clone(scopes))
            .unwrap_or_default();
        scopes.insert(self.id, scope.clone());

        let result = match ACTIVE_TRANSACTIONS.scope(Arc::new(scopes), work()).await {
            Ok(result) => result,
            Err(err) => {
                error!(lock_key, "Transaction failed, rolling back");
                return Err(err);
            }
        };

        let (mutations, hooks, db_queries) = {
            let mut state = scope.state.lock();
            (
                std::mem::take(&mut state.mutations),
                std::mem::take(&mut state.after_commit),
                state.db_queries,
            )
        };
        if let Err(err) = self.commit_with_retry(mutations).await {
            error!(lock_key, "Transaction commit failed: {}", err);
            return Err(err.into());
        }
        for hook in hooks {
            hook();
        }
        trace!(lock_key, db_queries, "Transaction completed");
        Ok(result)
    }

    async fn commit_with_retry(&self, mutations: Mutations) -> tessera_core::Result<()> {
        let count = mutation_count(&mutations);
        if count == 0 {
            trace!("No mutations in transaction");
            return Ok(());
        }

        trace!("Committing transaction");
        let max_attempts = self.config.max_commit_retries.max(1);
        let mut attempt = 0;
        loop {
            match self.store.set(mutations.clone()).await {
                Ok(()) => {
                    trace!(mutation_count = count, "Committed transaction");
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    let retries_left = max_attempts - attempt;
                    warn!("Failed to commit mutations, retries left={}", retries_left);
                    if retries_left == 0 {
                        return Err(err);
                    }
                    tokio::time::sleep(self.config.delay_between_tries()).await;
                }
            }
        }
    }

    async fn get_in_transaction(
        &self,
        scope: &TransactionScope,
        category: KeyCategory,
        ids: &[String],
    ) -> tessera_core::Result<HashMap<String, KeyValue>> {
        let missing: Vec<String> = {
            let state = scope.state.lock();
            let cached = state.cache.get(&category);
            ids.iter()
                .filter(|id| !cached.is_some_and(|c| c.contains_key(*id)))
                .cloned()
                .collect()
        };

        if !missing.is_empty() {
            trace!(%category, count = missing.len(), "Fetching missing keys in transaction");
            let fetched = self
                .fetch_locks
                .run_exclusive(category.as_str(), self.store.get(category, &missing))
                .await?;

            let mut state = scope.state.lock();
            state.db_queries += 1;
            let cache = state.cache.entry(category).or_default();
            for id in missing {
                let value = fetched.get(&id).cloned();
                // A write made while the read was in flight wins
                cache.entry(id).or_insert(value);
            }
        }

        let state = scope.state.lock();
        let Some(cached) = state.cache.get(&category) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| match cached.get(id) {
                Some(Some(value)) => Some((id.clone(), value.clone())),
                _ => None,
            })
            .collect())
    }

    fn set_in_transaction(&self, scope: &TransactionScope, mutations: Mutations) {
        trace!(categories = mutations.len(), "Caching in transaction");
        let mut state = scope.state.lock();
        for (category, data) in mutations {
            let data = if category == KeyCategory::PreKey {
                PreKeyDeletionValidator::filter_in_transaction(category, data, state.cache.get(&category))
            } else {
                data
            };
            state.cache.entry(category).or_default().extend(data.clone());
            state.mutations.entry(category).or_default().extend(data);
        }
    }

    async fn set_direct(&self, mut mutations: Mutations) -> tessera_core::Result<()> {
        if let Some(data) = mutations.get_mut(&KeyCategory::PreKey) {
            self.prekeys.validate_deletions(KeyCategory::PreKey, data).await?;
        }

        let writes = mutations
            .into_iter()
            .filter(|(_, data)| !data.is_empty())
            .map(|(category, data)| async move {
                let _guard = self.write_queues.lock(category.as_str()).await;
                self.store.set(HashMap::from([(category, data)])).await
            });
        try_join_all(writes).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyStore for TransactionalKeyStore {
    async fn get(
        &self,
        category: KeyCategory,
        ids: &[String],
    ) -> tessera_core::Result<HashMap<String, KeyValue>> {
        match self.current_scope() {
            Some(scope) => self.get_in_transaction(&scope, category, ids).await,
            None => self.store.get(category, ids).await,
        }
    }

    async fn set(&self, mutations: Mutations) -> tessera_core::Result<()> {
        match self.current_scope() {
            Some(scope) => {
                self.set_in_transaction(&scope, mutations);
                Ok(())
            }
            None => self.set_direct(mutations).await,
        }
    }

    async fn clear(&self) -> tessera_core::Result<()> {
        self.store.clear().await
    }
}
