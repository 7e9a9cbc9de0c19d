//! Encryption primitives consumed by the relay
//!
//! The ratchet and sender-key cryptography live outside this crate. The relay
//! only orchestrates calls into a [`SignalRepository`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tessera_core::Jid;

use crate::error::Result;

/// Kind of ciphertext produced for one device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CiphertextKind {
    /// Established-session message
    Msg,
    /// First message embedding key-establishment material
    PkMsg,
    /// Group sender-key message
    SkMsg,
}

impl CiphertextKind {
    /// Wire value of the `type` attribute
    pub fn as_str(&self) -> &'static str {
        match self {
            CiphertextKind::Msg => "msg",
            CiphertextKind::PkMsg => "pkmsg",
            CiphertextKind::SkMsg => "skmsg",
        }
    }

    /// Envelope must carry the device identity proof
    pub fn requires_device_identity(&self) -> bool {
        matches!(self, CiphertextKind::PkMsg)
    }
}

/// Ciphertext for one device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Ciphertext kind
    pub kind: CiphertextKind,
    /// Ciphertext bytes
    pub ciphertext: Vec<u8>,
}

/// Result of one sender-key encryption
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupEncryption {
    /// Ciphertext for every member
    pub ciphertext: Vec<u8>,
    /// Sender-key seed for members that lack it
    pub sender_key_distribution: Vec<u8>,
}

/// Outcome of a session probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionValidation {
    /// A usable session exists
    pub exists: bool,
    /// Why not, when it does not
    pub reason: Option<String>,
}

/// Signed pre-key of a bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Key id
    pub key_id: u32,
    /// Public key
    pub public_key: Vec<u8>,
    /// Signature by the identity key
    pub signature: Vec<u8>,
}

/// One-time pre-key of a bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Key id
    pub key_id: u32,
    /// Public key
    pub public_key: Vec<u8>,
}

/// Key material returned by a session-establishment query for one device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Device the bundle belongs to
    pub jid: Jid,
    /// Registration id
    pub registration_id: u32,
    /// Identity public key
    pub identity_key: Vec<u8>,
    /// Signed pre-key
    pub signed_pre_key: SignedPreKey,
    /// One-time pre-key, when the server had one left
    pub pre_key: Option<OneTimePreKey>,
}

/// Session and sender-key cryptography
#[async_trait]
pub trait SignalRepository: Send + Sync {
    /// Encrypt for one device, advancing its session
    async fn encrypt_message(&self, jid: &Jid, plaintext: &[u8]) -> Result<EncryptedMessage>;

    /// Encrypt once under the group sender key of `sender`
    async fn encrypt_group_message(
        &self,
        group: &Jid,
        plaintext: &[u8],
        sender: &Jid,
    ) -> Result<GroupEncryption>;

    /// Probe the persisted session for a device
    async fn validate_session(&self, jid: &Jid) -> Result<SessionValidation>;

    /// Build sessions from fetched bundles
    async fn inject_sessions(&self, bundles: Vec<PreKeyBundle>) -> Result<()>;
}
