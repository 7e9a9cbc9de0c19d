//! Phone-number / linked identity mapping
//!
//! Each mapping is persisted twice under the `lid-mapping` category:
//! `<pn user> -> <lid user>` and `<lid user>_reverse -> <pn user>`. A time-boxed
//! cache holds both directions as `pn:<user>` and `lid:<user>`. Lookups go
//! cache, then storage, then one batched network resolution for everything
//! still missing.
//!
//! Cache fills made inside a transaction wait for its commit, so the cache
//! never holds a mapping the store rolled back.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use tessera_core::storage::{KeyCategory, KeyStore, KeyValue};
use tessera_core::types::HOSTED_DEVICE;
use tessera_core::{Jid, LidPnPair, Server, TtlCache};

use crate::error::{ProtocolError, Result};
use crate::transaction::TransactionalKeyStore;

/// Transaction lock key for mapping writes
pub const LID_MAPPING_LOCK: &str = "lid-mapping";

/// Resolves linked identities for phone-number identities over the network
#[async_trait]
pub trait LidResolver: Send + Sync {
    /// One round trip for all `pns`. Unknown identities are left out.
    async fn resolve_lids(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>>;
}

enum Lookup {
    Found(String),
    Invalid,
    Missing,
}

/// Bidirectional identity mapping with cache and network fallback
pub struct LidMappingStore {
    keys: Arc<TransactionalKeyStore>,
    cache: Arc<Mutex<TtlCache<String, String>>>,
    resolver: Option<Arc<dyn LidResolver>>,
}

impl LidMappingStore {
    /// Mapping store over `keys`, caching entries for `ttl`
    pub fn new(
        keys: Arc<TransactionalKeyStore>,
        resolver: Option<Arc<dyn LidResolver>>,
        ttl: Duration,
    ) -> Self {
        Self {
            keys,
            cache: Arc::new(Mutex::new(TtlCache::new(ttl).update_age_on_get(true))),
            resolver,
        }
    }

    fn cache_pair(&self, pn_user: &str, lid_user: &str) {
        self.cache_entries(vec![
            (format!("pn:{}", pn_user), lid_user.to_string()),
            (format!("lid:{}", lid_user), pn_user.to_string()),
        ]);
    }

    fn cache_entries(&self, entries: Vec<(String, String)>) {
        let cache = self.cache.clone();
        self.keys.after_commit(move || {
            let mut cache = cache.lock();
            for (key, value) in entries {
                cache.insert(key, value);
            }
        });
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.cache.lock().get(key).cloned()
    }

    async fn stored_string(&self, id: &str) -> Result<Option<KeyValue>> {
        let mut stored = self
            .keys
            .get(KeyCategory::LidMapping, &[id.to_string()])
            .await?;
        Ok(stored.remove(id))
    }

    async fn lookup_lid_user(&self, pn_user: &str) -> Result<Lookup> {
        if let Some(lid_user) = self.cached(&format!("pn:{}", pn_user)) {
            return Ok(Lookup::Found(lid_user));
        }

        trace!("Cache miss for PN user {}; checking database", pn_user);
        match self.stored_string(pn_user).await? {
            None => Ok(Lookup::Missing),
            Some(value) => match value.as_str() {
                Some(lid_user) if !lid_user.is_empty() => {
                    self.cache_pair(pn_user, lid_user);
                    Ok(Lookup::Found(lid_user.to_string()))
                }
                _ => {
                    warn!("Invalid or empty LID user for PN user {}: {}", pn_user, value);
                    Ok(Lookup::Invalid)
                }
            },
        }
    }

    /// Persist mappings. Pairs must hold one phone-number and one linked
    /// identity (either order); other pairs are skipped, as are pairs that
    /// already match the stored mapping. Everything else lands in one
    /// transaction. Returns the number of mappings written.
    pub async fn store_lid_pn_mappings(&self, pairs: &[LidPnPair]) -> Result<usize> {
        let mut pair_map: Vec<(String, String)> = Vec::new();
        for pair in pairs {
            let (lid, pn) = if pair.lid.is_lid() && pair.pn.is_pn() {
                (&pair.lid, &pair.pn)
            } else if pair.lid.is_pn() && pair.pn.is_lid() {
                (&pair.pn, &pair.lid)
            } else {
                warn!("Invalid LID-PN mapping: {}, {}", pair.lid, pair.pn);
                continue;
            };

            if let Lookup::Found(existing) = self.lookup_lid_user(&pn.user).await? {
                if existing == lid.user {
                    debug!(pn_user = %pn.user, lid_user = %lid.user, "LID mapping already exists, skipping");
                    continue;
                }
            }

            match pair_map.iter_mut().find(|(pn_user, _)| *pn_user == pn.user) {
                Some(entry) => entry.1 = lid.user.clone(),
                None => pair_map.push((pn.user.clone(), lid.user.clone())),
            }
        }

        if pair_map.is_empty() {
            return Ok(0);
        }
        trace!("Storing {} pn mappings", pair_map.len());

        let keys = &self.keys;
        let writes = &pair_map;
        keys.transaction(LID_MAPPING_LOCK, move || async move {
            for (pn_user, lid_user) in writes {
                let data = HashMap::from([
                    (pn_user.clone(), Some(json!(lid_user))),
                    (format!("{}_reverse", lid_user), Some(json!(pn_user))),
                ]);
                keys.set(HashMap::from([(KeyCategory::LidMapping, data)]))
                    .await?;
            }
            Ok::<_, ProtocolError>(())
        })
        .await?;

        for (pn_user, lid_user) in &pair_map {
            self.cache_pair(pn_user, lid_user);
        }
        Ok(pair_map.len())
    }

    /// Linked identity for one phone-number identity, device preserved
    pub async fn get_lid_for_pn(&self, pn: &Jid) -> Result<Option<Jid>> {
        let pairs = self.get_lids_for_pns(std::slice::from_ref(pn)).await?;
        Ok(pairs.and_then(|pairs| pairs.into_iter().next().map(|pair| pair.lid)))
    }

    /// Linked identities for phone-number identities.
    ///
    /// Identities missing from cache and storage are resolved in one network
    /// call. Returns `None` when that call was needed and resolved nothing.
    pub async fn get_lids_for_pns(&self, pns: &[Jid]) -> Result<Option<Vec<LidPnPair>>> {
        let mut pairs: Vec<LidPnPair> = Vec::new();
        // pn user -> devices asked for
        let mut to_fetch: Vec<(String, Vec<u16>)> = Vec::new();

        for pn in pns {
            if !pn.is_pn_class() {
                continue;
            }
            let lid_user = match self.lookup_lid_user(&pn.user).await? {
                Lookup::Found(lid_user) => lid_user,
                Lookup::Invalid => continue,
                Lookup::Missing => {
                    trace!("No LID mapping found for PN user {}; batch resolving", pn.user);
                    let device = pn.device_or_zero();
                    match to_fetch.iter_mut().find(|(user, _)| *user == pn.user) {
                        Some((_, devices)) => devices.push(device),
                        None => to_fetch.push((pn.user.clone(), vec![device])),
                    }
                    continue;
                }
            };

            let server = if pn.is_hosted_pn() {
                Server::HostedLid
            } else {
                Server::Lid
            };
            let lid = Jid {
                user: lid_user,
                device: pn.device.filter(|&d| d != 0),
                server,
            };
            trace!("getLIDForPN: {} -> {}", pn, lid);
            push_unique(&mut pairs, LidPnPair { lid, pn: pn.clone() });
        }

        if to_fetch.is_empty() {
            return Ok(Some(pairs));
        }

        let Some(resolver) = &self.resolver else {
            return Ok(None);
        };
        // Hosted identities resolve through the plain phone-number server
        let requests: Vec<Jid> = to_fetch.iter().map(|(user, _)| Jid::pn(user.clone())).collect();
        let resolved = resolver.resolve_lids(&requests).await?;
        if resolved.is_empty() {
            return Ok(None);
        }

        self.store_lid_pn_mappings(&resolved).await?;

        for pair in &resolved {
            let (pn_user, lid_user) = (&pair.pn.user, &pair.lid.user);
            if pn_user.is_empty() || lid_user.is_empty() {
                continue;
            }
            let Some((_, devices)) = to_fetch.iter().find(|(user, _)| user == pn_user) else {
                continue;
            };
            for &device in devices {
                let hosted = device == HOSTED_DEVICE;
                let lid = Jid {
                    user: lid_user.clone(),
                    device: Some(device).filter(|&d| d != 0),
                    server: if hosted { Server::HostedLid } else { Server::Lid },
                };
                let pn = Jid {
                    user: pn_user.clone(),
                    device: Some(device).filter(|&d| d != 0),
                    server: if hosted { Server::HostedPn } else { Server::Pn },
                };
                trace!("getLIDForPN: resolved {} -> {}", pn, lid);
                push_unique(&mut pairs, LidPnPair { lid, pn });
            }
        }

        Ok(Some(pairs))
    }

    /// Phone-number identity for a linked identity, device preserved
    pub async fn get_pn_for_lid(&self, lid: &Jid) -> Result<Option<Jid>> {
        if !lid.is_lid_class() {
            return Ok(None);
        }

        let cache_key = format!("lid:{}", lid.user);
        let pn_user = match self.cached(&cache_key) {
            Some(pn_user) => pn_user,
            None => {
                let stored = self.stored_string(&format!("{}_reverse", lid.user)).await?;
                match stored.as_ref().and_then(|v| v.as_str()) {
                    Some(pn_user) if !pn_user.is_empty() => {
                        self.cache_entries(vec![(cache_key, pn_user.to_string())]);
                        pn_user.to_string()
                    }
                    _ => {
                        trace!("No reverse mapping found for LID user: {}", lid.user);
                        return Ok(None);
                    }
                }
            }
        };

        let server = if lid.is_hosted_lid() {
            Server::HostedPn
        } else {
            Server::Pn
        };
        let pn = Jid::device(pn_user, lid.device_or_zero(), server);
        trace!("Found reverse mapping: {} -> {}", lid, pn);
        Ok(Some(pn))
    }

    /// Phone-number identities for several linked identities. Unmapped ones
    /// are left out.
    pub async fn get_pns_for_lids(&self, lids: &[Jid]) -> Result<Vec<LidPnPair>> {
        let mut pairs = Vec::with_capacity(lids.len());
        for lid in lids {
            if let Some(pn) = self.get_pn_for_lid(lid).await? {
                pairs.push(LidPnPair {
                    lid: lid.clone(),
                    pn,
                });
            }
        }
        Ok(pairs)
    }
}

fn push_unique(pairs: &mut Vec<LidPnPair>, pair: LidPnPair) {
    match pairs.iter_mut().find(|p| p.pn == pair.pn) {
        Some(existing) => *existing = pair,
        None => pairs.push(pair),
    }
}
