//! Server queries and transmission consumed by the relay

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tessera_core::{Jid, LidPnPair};

use crate::envelope::Node;
use crate::error::Result;
use crate::lid_mapping::LidResolver;
use crate::signal::PreKeyBundle;

/// Which identity a group addresses its members by
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    /// Phone-number identities
    Pn,
    /// Linked identities
    #[default]
    Lid,
}

impl AddressingMode {
    /// Wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Pn => "pn",
            AddressingMode::Lid => "lid",
        }
    }

    /// Parse a wire value
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pn" => Some(AddressingMode::Pn),
            "lid" => Some(AddressingMode::Lid),
            _ => None,
        }
    }
}

/// Group metadata the relay needs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    /// Group address
    pub id: Jid,
    /// Member addresses
    pub participants: Vec<Jid>,
    /// Member addressing
    #[serde(default)]
    pub addressing_mode: AddressingMode,
    /// Disappearing-message timer in seconds
    pub ephemeral_duration: Option<u32>,
}

/// One device reported by a device query
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device index
    pub id: u16,
    /// Key index, required for every non-primary device
    pub key_index: Option<u32>,
    /// Device lives on a hosted server
    pub is_hosted: bool,
}

/// Devices of one user reported by a device query
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDevices {
    /// User queried
    pub id: Jid,
    /// Linked identity of the user, when the server reports one
    pub lid: Option<Jid>,
    /// Devices
    pub devices: Vec<DeviceInfo>,
}

/// Server queries and the transmission primitive
#[async_trait]
pub trait ServerClient: Send + Sync {
    /// One batched session-establishment query
    async fn fetch_prekey_bundles(&self, jids: &[Jid]) -> Result<Vec<PreKeyBundle>>;

    /// One batched device query
    async fn fetch_devices(&self, users: &[Jid]) -> Result<Vec<UserDevices>>;

    /// One batched identity resolution query
    async fn resolve_lids(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>>;

    /// Fetch group metadata
    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata>;

    /// Transmit a composed envelope
    async fn send_node(&self, node: Node) -> Result<()>;
}

/// Caller-maintained group metadata cache
#[async_trait]
pub trait GroupMetadataCache: Send + Sync {
    /// Cached metadata, if any
    async fn get(&self, group: &Jid) -> Option<GroupMetadata>;
}

/// Identity resolution through a [`ServerClient`]
pub struct ServerLidResolver {
    server: Arc<dyn ServerClient>,
}

impl ServerLidResolver {
    /// Resolve through `server`
    pub fn new(server: Arc<dyn ServerClient>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl LidResolver for ServerLidResolver {
    async fn resolve_lids(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>> {
        self.server.resolve_lids(pns).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addressing_mode() {
        assert_eq!(AddressingMode::default(), AddressingMode::Lid);
        assert_eq!(AddressingMode::parse("pn"), Some(AddressingMode::Pn));
        assert_eq!(AddressingMode::parse("x"), None);
        assert_eq!(AddressingMode::Lid.as_str(), "lid");
    }

    #[test]
    fn test_group_metadata_defaults() {
        let meta: GroupMetadata = serde_json::from_value(serde_json::json!({
            "id": "123-456@g.us",
            "participants": ["1@s.whatsapp.net"],
            "ephemeral_duration": null
        }))
        .unwrap();
        assert_eq!(meta.addressing_mode, AddressingMode::Lid);
        assert_eq!(meta.participants, vec![Jid::pn("1")]);
    }
}
