//! Device discovery
//!
//! Resolves user addresses to the device addresses a message must be
//! encrypted for. Explicit device addresses pass through; users are served
//! from a short-lived cache first and the rest go out in one server query.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tessera_core::storage::{KeyCategory, KeyStore};
use tessera_core::{DeviceTarget, Jid, LidPnPair, Server, TtlCache};

use crate::error::Result;
use crate::lid_mapping::LidMappingStore;
use crate::network::{ServerClient, UserDevices};
use crate::relay::Account;
use crate::transaction::TransactionalKeyStore;

/// Cached device discovery
pub struct DeviceDiscovery {
    server: Arc<dyn ServerClient>,
    keys: Arc<TransactionalKeyStore>,
    lid_mapping: Arc<LidMappingStore>,
    user_devices: Arc<Mutex<TtlCache<String, Vec<DeviceTarget>>>>,
}

impl DeviceDiscovery {
    /// Discovery caching per-user results for `ttl`
    pub fn new(
        server: Arc<dyn ServerClient>,
        keys: Arc<TransactionalKeyStore>,
        lid_mapping: Arc<LidMappingStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            server,
            keys,
            lid_mapping,
            user_devices: Arc::new(Mutex::new(TtlCache::new(ttl))),
        }
    }

    /// Device targets for `jids`.
    ///
    /// The local exact device is never returned. With `ignore_zero_devices`
    /// primary devices of discovered users are left out too.
    pub async fn get_devices(
        &self,
        account: &Account,
        jids: &[Jid],
        use_cache: bool,
        ignore_zero_devices: bool,
    ) -> Result<Vec<DeviceTarget>> {
        let mut targets = Vec::new();
        let mut to_fetch: Vec<Jid> = Vec::new();
        let mut seen = HashSet::new();

        for jid in jids {
            if jid.device.is_some() {
                targets.push(DeviceTarget::from_jid(jid.clone()));
                continue;
            }
            let user = jid.to_user_jid();
            if !seen.insert(user.to_string()) {
                continue;
            }
            if use_cache {
                if let Some(cached) = self.user_devices.lock().get(&user.user) {
                    targets.extend(cached.iter().cloned());
                    continue;
                }
            }
            to_fetch.push(user);
        }

        if to_fetch.is_empty() {
            return Ok(targets);
        }
        debug!("Fetching devices for {} users", to_fetch.len());

        let results = self.server.fetch_devices(&to_fetch).await?;

        let pairs: Vec<LidPnPair> = results
            .iter()
            .filter_map(|user| {
                user.lid.as_ref().map(|lid| LidPnPair {
                    lid: lid.to_user_jid(),
                    pn: user.id.to_user_jid(),
                })
            })
            .collect();
        if !pairs.is_empty() {
            self.lid_mapping.store_lid_pn_mappings(&pairs).await?;
        }

        let extracted = extract_device_jids(&results, account, ignore_zero_devices);
        let mut per_user: Vec<(String, Vec<DeviceTarget>)> = Vec::new();
        for target in extracted {
            match per_user.iter_mut().find(|(user, _)| *user == target.user) {
                Some((_, devices)) => devices.push(target),
                None => per_user.push((target.user.clone(), vec![target])),
            }
        }

        let mut device_list = HashMap::new();
        for (user, devices) in &per_user {
            let ids: Vec<String> = devices.iter().map(|d| d.device.to_string()).collect();
            device_list.insert(user.clone(), Some(json!(ids)));
            targets.extend(devices.iter().cloned());
        }
        // Cached only once the surrounding send commits
        let cache = self.user_devices.clone();
        self.keys.after_commit(move || {
            let mut cache = cache.lock();
            for (user, devices) in per_user {
                cache.insert(user, devices);
            }
        });

        if !device_list.is_empty() {
            let write = self
                .keys
                .set(HashMap::from([(KeyCategory::DeviceList, device_list)]))
                .await;
            if let Err(err) = write {
                warn!("Failed to persist device list: {}", err);
            }
        }

        Ok(targets)
    }

    /// Forget cached devices of `user`
    pub fn invalidate(&self, user: &str) {
        self.user_devices.lock().remove(user);
    }
}

/// Device targets from a device query result.
///
/// Drops the local exact device, primary devices when `exclude_zero_devices`
/// is set, and non-primary devices reported without a key index. Hosted
/// devices are addressed on the hosted servers.
pub fn extract_device_jids(
    results: &[UserDevices],
    account: &Account,
    exclude_zero_devices: bool,
) -> Vec<DeviceTarget> {
    let my_user = account.id.user.as_str();
    let my_device = account.id.device_or_zero();
    let my_lid_user = account.lid.as_ref().map(|lid| lid.user.as_str());

    let mut targets = Vec::new();
    for result in results {
        let user = result.id.user.as_str();
        let is_me = user == my_user || Some(user) == my_lid_user;
        for device in &result.devices {
            if exclude_zero_devices && device.id == 0 {
                continue;
            }
            if is_me && device.id == my_device {
                continue;
            }
            if device.id != 0 && device.key_index.is_none() {
                continue;
            }
            let server = match (device.is_hosted, result.id.is_lid_class()) {
                (true, true) => Server::HostedLid,
                (true, false) => Server::HostedPn,
                (false, _) => result.id.server,
            };
            targets.push(DeviceTarget::from_jid(Jid::device(user, device.id, server)));
        }
    }
    targets
}
