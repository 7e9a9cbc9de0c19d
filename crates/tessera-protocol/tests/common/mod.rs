//! Collaborators used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tessera_core::storage::memory::MemoryKeyStore;
use tessera_core::storage::{KeyCategory, KeyStore, KeyValue, Mutations};
use tessera_core::{Jid, LidPnPair, Server};
use tessera_protocol::network::{DeviceInfo, GroupMetadata, UserDevices};
use tessera_protocol::signal::{
    CiphertextKind, EncryptedMessage, GroupEncryption, PreKeyBundle, SessionValidation, SignedPreKey,
};
use tessera_protocol::{Account, Node, ProtocolError, Result, ServerClient, SignalRepository};

/// Signal repository that "encrypts" by copying the plaintext.
///
/// Sessions built from fetched bundles stay pending, so they produce
/// first-message ciphertexts.
#[derive(Default)]
pub struct MockSignal {
    sessions: Mutex<HashSet<String>>,
    pending: Mutex<HashSet<String>>,
    pub encrypted_for: Mutex<Vec<Jid>>,
    pub validations: AtomicUsize,
}

impl MockSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a session with each of `jids` exists
    pub fn with_sessions(jids: &[Jid]) -> Self {
        let signal = Self::default();
        for jid in jids {
            signal
                .sessions
                .lock()
                .insert(jid.signal_address().to_string());
        }
        signal
    }

    pub fn is_established(&self, jid: &Jid) -> bool {
        self.sessions
            .lock()
            .contains(&jid.signal_address().to_string())
    }

    pub fn has_session(&self, jid: &Jid) -> bool {
        self.is_established(jid)
            || self
                .pending
                .lock()
                .contains(&jid.signal_address().to_string())
    }
}

#[async_trait]
impl SignalRepository for MockSignal {
    async fn encrypt_message(&self, jid: &Jid, plaintext: &[u8]) -> Result<EncryptedMessage> {
        self.encrypted_for.lock().push(jid.clone());
        let kind = if self.is_established(jid) {
            CiphertextKind::Msg
        } else {
            CiphertextKind::PkMsg
        };
        Ok(EncryptedMessage {
            kind,
            ciphertext: plaintext.to_vec(),
        })
    }

    async fn encrypt_group_message(
        &self,
        _group: &Jid,
        plaintext: &[u8],
        _sender: &Jid,
    ) -> Result<GroupEncryption> {
        Ok(GroupEncryption {
            ciphertext: plaintext.to_vec(),
            sender_key_distribution: b"sender-key".to_vec(),
        })
    }

    async fn validate_session(&self, jid: &Jid) -> Result<SessionValidation> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        let exists = self.has_session(jid);
        Ok(SessionValidation {
            exists,
            reason: (!exists).then(|| "no session".to_string()),
        })
    }

    async fn inject_sessions(&self, bundles: Vec<PreKeyBundle>) -> Result<()> {
        let mut sessions = self.pending.lock();
        for bundle in bundles {
            sessions.insert(bundle.jid.signal_address().to_string());
        }
        Ok(())
    }
}

/// Server with canned devices, groups and identity mappings
#[derive(Default)]
pub struct MockServer {
    devices: Mutex<HashMap<String, UserDevices>>,
    groups: Mutex<HashMap<String, GroupMetadata>>,
    lids: Mutex<HashMap<String, String>>,
    pub sent: Mutex<Vec<Node>>,
    pub prekey_fetches: Mutex<Vec<Vec<Jid>>>,
    pub device_fetches: Mutex<Vec<Vec<Jid>>>,
    pub lid_resolutions: AtomicUsize,
    pub fail_sends: AtomicBool,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` with the given device ids
    pub fn add_user(&self, user: Jid, device_ids: &[u16]) {
        let devices = device_ids
            .iter()
            .map(|&id| DeviceInfo {
                id,
                key_index: (id != 0).then_some(1),
                is_hosted: false,
            })
            .collect();
        self.devices.lock().insert(
            user.user.clone(),
            UserDevices {
                id: user,
                lid: None,
                devices,
            },
        );
    }

    /// Make the device query for `pn_user` also report its linked identity
    pub fn report_lid(&self, pn_user: &str, lid_user: &str) {
        if let Some(user) = self.devices.lock().get_mut(pn_user) {
            user.lid = Some(Jid::lid(lid_user));
        }
    }

    pub fn add_group(&self, metadata: GroupMetadata) {
        self.groups.lock().insert(metadata.id.to_string(), metadata);
    }

    pub fn add_lid(&self, pn_user: &str, lid_user: &str) {
        self.lids
            .lock()
            .insert(pn_user.to_string(), lid_user.to_string());
    }

    pub fn last_sent(&self) -> Node {
        self.sent.lock().last().cloned().expect("nothing sent")
    }
}

#[async_trait]
impl ServerClient for MockServer {
    async fn fetch_prekey_bundles(&self, jids: &[Jid]) -> Result<Vec<PreKeyBundle>> {
        self.prekey_fetches.lock().push(jids.to_vec());
        Ok(jids
            .iter()
            .map(|jid| PreKeyBundle {
                jid: jid.clone(),
                registration_id: 1,
                identity_key: vec![5; 33],
                signed_pre_key: SignedPreKey {
                    key_id: 1,
                    public_key: vec![6; 33],
                    signature: vec![7; 64],
                },
                pre_key: None,
            })
            .collect())
    }

    async fn fetch_devices(&self, users: &[Jid]) -> Result<Vec<UserDevices>> {
        self.device_fetches.lock().push(users.to_vec());
        let devices = self.devices.lock();
        Ok(users
            .iter()
            .filter_map(|user| devices.get(&user.user).cloned())
            .collect())
    }

    async fn resolve_lids(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>> {
        self.lid_resolutions.fetch_add(1, Ordering::SeqCst);
        let lids = self.lids.lock();
        Ok(pns
            .iter()
            .filter_map(|pn| {
                lids.get(&pn.user).map(|lid| LidPnPair {
                    lid: Jid::lid(lid.clone()),
                    pn: pn.to_user_jid(),
                })
            })
            .collect())
    }

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata> {
        self.groups
            .lock()
            .get(&group.to_string())
            .cloned()
            .ok_or_else(|| ProtocolError::Network(format!("item-not-found: {}", group)))
    }

    async fn send_node(&self, node: Node) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::Network("connection closed".into()));
        }
        self.sent.lock().push(node);
        Ok(())
    }
}

/// In-memory store that fails a set number of writes first
pub struct FlakyStore {
    pub inner: MemoryKeyStore,
    failures_left: AtomicUsize,
    pub set_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryKeyStore::new(),
            failures_left: AtomicUsize::new(failures),
            set_calls: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> HashMap<KeyCategory, HashMap<String, KeyValue>> {
        self.inner.snapshot()
    }
}

#[async_trait]
impl KeyStore for FlakyStore {
    async fn get(&self, category: KeyCategory, ids: &[String]) -> tessera_core::Result<HashMap<String, KeyValue>> {
        self.inner.get(category, ids).await
    }

    async fn set(&self, mutations: Mutations) -> tessera_core::Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(tessera_core::Error::Storage("connection reset".into()));
        }
        self.inner.set(mutations).await
    }
}

/// Account on device 1 of user 100, linked identity 900
pub fn account() -> Account {
    Account {
        id: Jid::device("100", 1, Server::Pn),
        lid: Some(Jid::lid("900")),
        device_identity: b"signed-identity".to_vec(),
    }
}
