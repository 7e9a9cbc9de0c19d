//! Key-value store contract for signal key material
//!
//! Key material is stored as `category / id -> value` triples. A write is a
//! [`Mutations`] map where `None` marks a deletion. Backends implement
//! [`KeyStore`]; this module ships an in-memory backend and a read-through
//! cached wrapper.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

use crate::cache::TtlCache;
use crate::error::{Error, Result};

/// Stored value
pub type KeyValue = serde_json::Value;

/// Writes for one category. `None` deletes the id.
pub type CategoryData = HashMap<String, Option<KeyValue>>;

/// Writes across categories
pub type Mutations = HashMap<KeyCategory, CategoryData>;

/// Category of stored key material
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyCategory {
    /// One-time pre-keys
    PreKey,
    /// Pairwise ratchet sessions
    Session,
    /// Group sender keys
    SenderKey,
    /// Per-group record of which devices hold our sender key
    SenderKeyMemory,
    /// App state sync keys
    AppStateSyncKey,
    /// App state sync versions
    AppStateSyncVersion,
    /// Phone-number / linked identity mappings
    LidMapping,
    /// Known device lists per user
    DeviceList,
    /// Trusted contact tokens
    TcToken,
    /// Remote identity keys
    IdentityKey,
}

impl KeyCategory {
    /// All categories
    pub const ALL: [KeyCategory; 10] = [
        KeyCategory::PreKey,
        KeyCategory::Session,
        KeyCategory::SenderKey,
        KeyCategory::SenderKeyMemory,
        KeyCategory::AppStateSyncKey,
        KeyCategory::AppStateSyncVersion,
        KeyCategory::LidMapping,
        KeyCategory::DeviceList,
        KeyCategory::TcToken,
        KeyCategory::IdentityKey,
    ];

    /// Storage name of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyCategory::PreKey => "pre-key",
            KeyCategory::Session => "session",
            KeyCategory::SenderKey => "sender-key",
            KeyCategory::SenderKeyMemory => "sender-key-memory",
            KeyCategory::AppStateSyncKey => "app-state-sync-key",
            KeyCategory::AppStateSyncVersion => "app-state-sync-version",
            KeyCategory::LidMapping => "lid-mapping",
            KeyCategory::DeviceList => "device-list",
            KeyCategory::TcToken => "tctoken",
            KeyCategory::IdentityKey => "identity-key",
        }
    }
}

impl fmt::Display for KeyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backing store for key material
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Values for the given ids. Absent ids are missing from the result.
    async fn get(&self, category: KeyCategory, ids: &[String]) -> Result<HashMap<String, KeyValue>>;

    /// Apply writes. `None` values delete.
    async fn set(&self, mutations: Mutations) -> Result<()>;

    /// Drop everything
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Decode a stored value into a typed record
pub fn decode_value<T: DeserializeOwned>(category: KeyCategory, id: &str, value: &KeyValue) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| Error::InvalidValue {
        category: category.to_string(),
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Encode a typed record for storage
pub fn encode_value<T: Serialize>(value: &T) -> Result<KeyValue> {
    Ok(serde_json::to_value(value)?)
}

/// Number of ids written across all categories
pub fn mutation_count(mutations: &Mutations) -> usize {
    mutations.values().map(|data| data.len()).sum()
}

/// Merge `incoming` into `target`, later writes winning per id
pub fn merge_mutations(target: &mut Mutations, incoming: Mutations) {
    for (category, data) in incoming {
        target.entry(category).or_default().extend(data);
    }
}

pub mod memory {
    //! In-memory [`KeyStore`](super::KeyStore)

    use super::*;
    use parking_lot::RwLock;

    /// Key store held in a map
    #[derive(Default)]
    pub struct MemoryKeyStore {
        data: RwLock<HashMap<KeyCategory, HashMap<String, KeyValue>>>,
    }

    impl MemoryKeyStore {
        /// Empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored ids in a category
        pub fn count(&self, category: KeyCategory) -> usize {
            self.data.read().get(&category).map_or(0, |data| data.len())
        }

        /// Copy of everything stored
        pub fn snapshot(&self) -> HashMap<KeyCategory, HashMap<String, KeyValue>> {
            self.data.read().clone()
        }
    }

    #[async_trait]
    impl KeyStore for MemoryKeyStore {
        async fn get(&self, category: KeyCategory, ids: &[String]) -> Result<HashMap<String, KeyValue>> {
            let data = self.data.read();
            let Some(values) = data.get(&category) else {
                return Ok(HashMap::new());
            };
            Ok(ids
                .iter()
                .filter_map(|id| values.get(id).map(|v| (id.clone(), v.clone())))
                .collect())
        }

        async fn set(&self, mutations: Mutations) -> Result<()> {
            let mut data = self.data.write();
            for (category, writes) in mutations {
                let values = data.entry(category).or_default();
                for (id, value) in writes {
                    match value {
                        Some(value) => {
                            values.insert(id, value);
                        }
                        None => {
                            values.remove(&id);
                        }
                    }
                }
            }
            Ok(())
        }

        async fn clear(&self) -> Result<()> {
            self.data.write().clear();
            Ok(())
        }
    }
}

/// [`KeyStore`] wrapper with a time-boxed read-through cache.
///
/// All cache operations are serialized through one mutex. Writes go through
/// to the inner store.
pub struct CachedKeyStore {
    inner: Arc<dyn KeyStore>,
    cache: Mutex<TtlCache<String, KeyValue>>,
}

impl CachedKeyStore {
    /// Wrap `inner`, caching values for `ttl`
    pub fn new(inner: Arc<dyn KeyStore>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Mutex::new(TtlCache::new(ttl)),
        }
    }

    fn cache_key(category: KeyCategory, id: &str) -> String {
        format!("{}.{}", category, id)
    }
}

#[async_trait]
impl KeyStore for CachedKeyStore {
    async fn get(&self, category: KeyCategory, ids: &[String]) -> Result<HashMap<String, KeyValue>> {
        let mut cache = self.cache.lock().await;

        let mut result = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match cache.get(&Self::cache_key(category, id)) {
                Some(value) => {
                    result.insert(id.clone(), value.clone());
                }
                None => missing.push(id.clone()),
            }
        }

        if !missing.is_empty() {
            trace!("Cache miss for {} {} ids", missing.len(), category);
            let fetched = self.inner.get(category, &missing).await?;
            for (id, value) in fetched {
                cache.insert(Self::cache_key(category, &id), value.clone());
                result.insert(id, value);
            }
        }

        Ok(result)
    }

    async fn set(&self, mutations: Mutations) -> Result<()> {
        let mut cache = self.cache.lock().await;
        // The cache only mirrors writes the inner store accepted
        self.inner.set(mutations.clone()).await?;
        for (category, writes) in mutations {
            for (id, value) in writes {
                let key = Self::cache_key(category, &id);
                match value {
                    Some(value) => {
                        cache.insert(key, value);
                    }
                    None => {
                        cache.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.cache.lock().await.clear();
        self.inner.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryKeyStore;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts reads reaching the wrapped store
    struct CountingStore {
        inner: MemoryKeyStore,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl KeyStore for CountingStore {
        async fn get(&self, category: KeyCategory, ids: &[String]) -> Result<HashMap<String, KeyValue>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(category, ids).await
        }

        async fn set(&self, mutations: Mutations) -> Result<()> {
            self.inner.set(mutations).await
        }
    }

    fn write(category: KeyCategory, id: &str, value: Option<KeyValue>) -> Mutations {
        HashMap::from([(category, HashMap::from([(id.to_string(), value)]))])
    }

    #[test]
    fn test_category_names() {
        assert_eq!(KeyCategory::PreKey.as_str(), "pre-key");
        assert_eq!(KeyCategory::LidMapping.to_string(), "lid-mapping");
        assert_eq!(
            serde_json::to_string(&KeyCategory::SenderKeyMemory).unwrap(),
            "\"sender-key-memory\""
        );
        for category in KeyCategory::ALL {
            let encoded = serde_json::to_string(&category).unwrap();
            assert_eq!(encoded, format!("\"{}\"", category.as_str()));
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_memory_store_set_and_delete() {
        let store = MemoryKeyStore::new();
        store
            .set(write(KeyCategory::Session, "a.0", Some(json!("s1"))))
            .await
            .unwrap();

        let ids = vec!["a.0".to_string(), "b.0".to_string()];
        let got = store.get(KeyCategory::Session, &ids).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["a.0"], json!("s1"));

        store
            .set(write(KeyCategory::Session, "a.0", None))
            .await
            .unwrap();
        assert!(store.get(KeyCategory::Session, &ids).await.unwrap().is_empty());
        assert_eq!(store.count(KeyCategory::Session), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_cached_store_reads_through_once() {
        let counting = Arc::new(CountingStore {
            inner: MemoryKeyStore::new(),
            gets: AtomicUsize::new(0),
        });
        counting
            .set(write(KeyCategory::PreKey, "1", Some(json!({"k": 1}))))
            .await
            .unwrap();

        let cached = CachedKeyStore::new(counting.clone(), Duration::from_secs(300));
        let ids = vec!["1".to_string()];
        assert_eq!(cached.get(KeyCategory::PreKey, &ids).await.unwrap().len(), 1);
        assert_eq!(cached.get(KeyCategory::PreKey, &ids).await.unwrap().len(), 1);
        assert_eq!(counting.gets.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_cached_store_delete_drops_cache_entry() {
        let inner = Arc::new(MemoryKeyStore::new());
        let cached = CachedKeyStore::new(inner.clone(), Duration::from_secs(300));

        cached
            .set(write(KeyCategory::PreKey, "1", Some(json!(1))))
            .await
            .unwrap();
        cached
            .set(write(KeyCategory::PreKey, "1", None))
            .await
            .unwrap();

        let ids = vec!["1".to_string()];
        assert!(cached.get(KeyCategory::PreKey, &ids).await.unwrap().is_empty());
        assert_eq!(inner.count(KeyCategory::PreKey), 0);
    }

    /// Rejects every write
    struct DownStore;

    #[async_trait]
    impl KeyStore for DownStore {
        async fn get(&self, _category: KeyCategory, _ids: &[String]) -> Result<HashMap<String, KeyValue>> {
            Ok(HashMap::new())
        }

        async fn set(&self, _mutations: Mutations) -> Result<()> {
            Err(Error::Storage("down".into()))
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_cached_store_ignores_rejected_write() {
        let cached = CachedKeyStore::new(Arc::new(DownStore), Duration::from_secs(300));

        let err = cached
            .set(write(KeyCategory::Session, "a", Some(json!(1))))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let ids = vec!["a".to_string()];
        assert!(cached.get(KeyCategory::Session, &ids).await.unwrap().is_empty());
    }

    #[test]
    fn test_decode_value_reports_location() {
        let err = decode_value::<u32>(KeyCategory::LidMapping, "123", &json!("x")).unwrap_err();
        match err {
            Error::InvalidValue { category, id, .. } => {
                assert_eq!(category, "lid-mapping");
                assert_eq!(id, "123");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_merge_mutations_later_wins() {
        let mut target = write(KeyCategory::Session, "a", Some(json!(1)));
        merge_mutations(&mut target, write(KeyCategory::Session, "a", None));
        merge_mutations(&mut target, write(KeyCategory::PreKey, "p", Some(json!(2))));
        assert_eq!(target[&KeyCategory::Session]["a"], None);
        assert_eq!(mutation_count(&target), 2);
    }
}
