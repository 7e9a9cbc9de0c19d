//! Session assertion
//!
//! Makes sure a ratchet session exists for every target device before fan-out.
//! Presence is checked against a short-lived cache, then the persisted
//! session. Devices still lacking one are resolved to their wire address and
//! fetched in a single batch.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use tessera_core::{Jid, TtlCache};

use crate::error::Result;
use crate::lid_mapping::LidMappingStore;
use crate::network::ServerClient;
use crate::signal::SignalRepository;

/// Ensures sessions exist for target devices
pub struct SessionAsserter {
    signal: Arc<dyn SignalRepository>,
    server: Arc<dyn ServerClient>,
    lid_mapping: Arc<LidMappingStore>,
    peer_sessions: Mutex<TtlCache<String, bool>>,
}

impl SessionAsserter {
    /// Asserter caching session presence for `ttl`
    pub fn new(
        signal: Arc<dyn SignalRepository>,
        server: Arc<dyn ServerClient>,
        lid_mapping: Arc<LidMappingStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            signal,
            server,
            lid_mapping,
            peer_sessions: Mutex::new(TtlCache::new(ttl)),
        }
    }

    /// Establish missing sessions for `jids`.
    ///
    /// Returns whether a session-establishment query was issued.
    pub async fn assert_sessions(&self, jids: &[Jid]) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();

        for jid in jids {
            if !seen.insert(jid.to_string()) {
                continue;
            }
            let address = jid.signal_address().to_string();
            let cached = self.peer_sessions.lock().get(&address).copied();
            let exists = match cached {
                Some(exists) => exists,
                None => {
                    let validation = self.signal.validate_session(jid).await?;
                    self.peer_sessions
                        .lock()
                        .insert(address.clone(), validation.exists);
                    validation.exists
                }
            };
            if exists {
                trace!(address, "Session present");
            } else {
                missing.push(jid.clone());
            }
        }

        if missing.is_empty() {
            return Ok(false);
        }

        let wire_jids = self.wire_addresses(&missing).await?;
        if wire_jids.is_empty() {
            return Ok(false);
        }
        debug!("Fetching sessions for {} devices", wire_jids.len());

        let bundles = self.server.fetch_prekey_bundles(&wire_jids).await?;
        self.signal.inject_sessions(bundles).await?;

        let mut cache = self.peer_sessions.lock();
        for jid in wire_jids.iter().chain(&missing) {
            cache.insert(jid.signal_address().to_string(), true);
        }
        Ok(true)
    }

    /// Forget cached presence for `jid`
    pub fn invalidate(&self, jid: &Jid) {
        self.peer_sessions
            .lock()
            .remove(&jid.signal_address().to_string());
    }

    /// Linked identity where one is known, the phone-number address otherwise
    async fn wire_addresses(&self, jids: &[Jid]) -> Result<Vec<Jid>> {
        let mut wire: Vec<Jid> = jids.iter().filter(|j| j.is_lid_class()).cloned().collect();
        let pns: Vec<Jid> = jids.iter().filter(|j| j.is_pn_class()).cloned().collect();
        if pns.is_empty() {
            return Ok(wire);
        }

        let mapped = self
            .lid_mapping
            .get_lids_for_pns(&pns)
            .await?
            .unwrap_or_default();
        for pn in pns {
            let lid = mapped.iter().find(|pair| {
                pair.pn.user == pn.user && pair.pn.device_or_zero() == pn.device_or_zero()
            });
            match lid {
                Some(pair) => wire.push(pair.lid.clone()),
                None => wire.push(pn),
            }
        }
        Ok(wire)
    }
}
