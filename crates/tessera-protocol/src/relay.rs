//! Relay engine
//!
//! [`RelayEngine::relay_message`] turns one outbound message into a single
//! envelope carrying a ciphertext for every recipient device:
//!
//! 1. resolve the target kind (direct, group, status broadcast, channel) and
//!    the devices to reach
//! 2. make sure a session exists for each of them
//! 3. encrypt per device, serialized per device address
//! 4. compose the envelope, attaching sender-key distribution, the device
//!    identity proof and business metadata as needed
//! 5. transmit, then record the message for retry correlation
//!
//! The whole send runs as one key-store transaction under the account's own
//! address, so sender-key memory, device lists and identity mappings written
//! along the way commit together.

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use tessera_core::message::{PeerDataOperationRequest, ProtocolMessage};
use tessera_core::storage::{decode_value, encode_value, KeyCategory, KeyStore};
use tessera_core::types::HOSTED_DEVICE;
use tessera_core::{DeviceTarget, Jid, Message, MessageContent, Server};

use crate::config::ClientConfig;
use crate::devices::DeviceDiscovery;
use crate::encoding::{encode_message, encode_plaintext, generate_message_id};
use crate::envelope::{bot_node, business_nodes, has_business_node, Attrs, Node};
use crate::error::{ProtocolError, Result};
use crate::lid_mapping::LidMappingStore;
use crate::mutex::KeyedMutex;
use crate::network::{AddressingMode, GroupMetadata, GroupMetadataCache, ServerClient, ServerLidResolver};
use crate::receipt::{aggregate_message_keys_not_from_me, build_receipt, MessageKey, ReceiptType};
use crate::retry::MessageRetryManager;
use crate::sessions::SessionAsserter;
use crate::signal::{EncryptedMessage, SignalRepository};
use crate::transaction::TransactionalKeyStore;
use crate::ENC_VERSION;

/// Devices known to hold this account's sender key, per group
type SenderKeyMemory = HashMap<String, bool>;

/// The logged-in account
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    /// Own phone-number device address
    pub id: Jid,
    /// Own linked identity
    pub lid: Option<Jid>,
    /// Signed device identity, attached when a recipient needs a first-message ciphertext
    pub device_identity: Vec<u8>,
}

impl Account {
    /// Own linked device address
    pub fn lid_device(&self) -> Option<Jid> {
        self.lid.as_ref().map(|lid| match lid.device {
            Some(_) => lid.clone(),
            None => lid.with_device(self.id.device_or_zero()),
        })
    }

    /// `jid` is exactly this device, under either identity
    pub fn is_exact_device(&self, jid: &Jid) -> bool {
        jid.is_same_device(&self.id)
            || self
                .lid_device()
                .is_some_and(|lid| jid.is_same_device(&lid))
    }

    /// `user` is this account, under either identity
    pub fn is_own_user(&self, user: &str) -> bool {
        self.id.user == user || self.lid.as_ref().is_some_and(|lid| lid.user == user)
    }
}

/// A resend to one device after it reported a decryption failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryParticipant {
    /// Device to resend to
    pub jid: Jid,
    /// Resend attempt
    pub count: u32,
}

/// Per-send options
#[derive(Clone, Debug)]
pub struct RelayOptions {
    /// Message id, generated when absent
    pub message_id: Option<String>,
    /// Resend to this device only
    pub participant: Option<RetryParticipant>,
    /// Extra envelope attributes
    pub additional_attributes: Attrs,
    /// Extra envelope children
    pub additional_nodes: Vec<Node>,
    /// Serve user devices from the cache when possible
    pub use_user_devices_cache: bool,
    /// Read group metadata from the caller's cache when possible
    pub use_cached_group_metadata: bool,
    /// Recipients of a status broadcast
    pub status_jid_list: Vec<Jid>,
    /// Mark a direct message as addressed to a business bot
    pub ai: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            message_id: None,
            participant: None,
            additional_attributes: Attrs::new(),
            additional_nodes: Vec::new(),
            use_user_devices_cache: true,
            use_cached_group_metadata: true,
            status_jid_list: Vec::new(),
            ai: false,
        }
    }
}

/// Output of a content patch
#[derive(Clone, Debug, PartialEq)]
pub enum PatchedMessage {
    /// One message for every recipient
    Single(Message),
    /// A variant per recipient
    PerRecipient(Vec<(Jid, Message)>),
}

/// Transforms content right before encryption
#[async_trait]
pub trait MessagePatcher: Send + Sync {
    /// Patch `message` for `recipients` (empty for group and channel sends)
    async fn patch(&self, message: &Message, recipients: &[Jid]) -> Result<PatchedMessage>;
}

/// Encrypted `to` nodes for a set of devices
#[derive(Debug, Default)]
pub struct ParticipantNodes {
    /// One `to` node per device
    pub nodes: Vec<Node>,
    /// Some device received a first-message ciphertext
    pub include_device_identity: bool,
}

#[derive(Clone, Copy)]
struct RelayRequest<'a> {
    jid: &'a Jid,
    message: &'a Message,
    options: &'a RelayOptions,
    account: &'a Account,
    message_id: &'a str,
}

#[derive(Default)]
struct Composed {
    participants: Vec<Node>,
    content: Vec<Node>,
    include_device_identity: bool,
}

/// Session assertion and encrypted fan-out
pub struct RelayEngine {
    config: ClientConfig,
    keys: Arc<TransactionalKeyStore>,
    signal: Arc<dyn SignalRepository>,
    server: Arc<dyn ServerClient>,
    lid_mapping: Arc<LidMappingStore>,
    retry: Arc<MessageRetryManager>,
    devices: DeviceDiscovery,
    sessions: SessionAsserter,
    encryption_locks: KeyedMutex,
    group_cache: Option<Arc<dyn GroupMetadataCache>>,
    patcher: Option<Arc<dyn MessagePatcher>>,
    account: RwLock<Option<Account>>,
}

impl RelayEngine {
    /// Create an engine over `store`
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn KeyStore>,
        signal: Arc<dyn SignalRepository>,
        server: Arc<dyn ServerClient>,
    ) -> Result<Self> {
        config.validate().map_err(ProtocolError::Config)?;

        let keys = Arc::new(TransactionalKeyStore::new(store, config.transaction.clone()));
        let resolver = Arc::new(ServerLidResolver::new(server.clone()));
        let lid_mapping = Arc::new(LidMappingStore::new(
            keys.clone(),
            Some(resolver),
            config.cache.lid_mapping_ttl(),
        ));
        let retry = Arc::new(MessageRetryManager::new(config.retry.clone()));
        let devices = DeviceDiscovery::new(
            server.clone(),
            keys.clone(),
            lid_mapping.clone(),
            config.cache.user_devices_ttl(),
        );
        let sessions = SessionAsserter::new(
            signal.clone(),
            server.clone(),
            lid_mapping.clone(),
            config.cache.peer_sessions_ttl(),
        );

        Ok(Self {
            config,
            keys,
            signal,
            server,
            lid_mapping,
            retry,
            devices,
            sessions,
            encryption_locks: KeyedMutex::new(),
            group_cache: None,
            patcher: None,
            account: RwLock::new(None),
        })
    }

    /// Read group metadata from `cache` before asking the server
    pub fn with_group_cache(mut self, cache: Arc<dyn GroupMetadataCache>) -> Self {
        self.group_cache = Some(cache);
        self
    }

    /// Patch content before encryption
    pub fn with_patcher(mut self, patcher: Arc<dyn MessagePatcher>) -> Self {
        self.patcher = Some(patcher);
        self
    }

    /// Log in
    pub fn set_account(&self, account: Account) {
        *self.account.write() = Some(account);
    }

    /// Log out
    pub fn clear_account(&self) {
        *self.account.write() = None;
    }

    /// Logged-in account
    pub fn account(&self) -> Option<Account> {
        self.account.read().clone()
    }

    /// Configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Transactional key store
    pub fn keys(&self) -> &Arc<TransactionalKeyStore> {
        &self.keys
    }

    /// Identity mapping store
    pub fn lid_mapping(&self) -> &Arc<LidMappingStore> {
        &self.lid_mapping
    }

    /// Retry manager
    pub fn retry_manager(&self) -> &Arc<MessageRetryManager> {
        &self.retry
    }

    /// Device addresses with an encryption currently running or queued
    pub fn active_encryption_locks(&self) -> usize {
        self.encryption_locks.len()
    }

    fn current_account(&self) -> Result<Account> {
        self.account().ok_or(ProtocolError::NotAuthenticated)
    }

    /// Encrypt and send `message` to `jid`. Returns the message id.
    #[instrument(skip(self, message, options), fields(to = %jid))]
    pub async fn relay_message(
        &self,
        jid: &Jid,
        message: &Message,
        options: RelayOptions,
    ) -> Result<String> {
        let account = self.current_account()?;
        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_id(Some(&account.id)));

        let request = RelayRequest {
            jid,
            message,
            options: &options,
            account: &account,
            message_id: &message_id,
        };
        let lock_key = account.id.to_string();
        self.keys
            .transaction(&lock_key, move || async move { self.relay_in_transaction(request).await })
            .await?;

        Ok(message_id)
    }

    async fn relay_in_transaction(&self, request: RelayRequest<'_>) -> Result<()> {
        let RelayRequest {
            jid,
            message,
            options,
            account,
            message_id,
        } = request;

        let mut stanza_attrs = options.additional_attributes.clone();
        let mut devices = Vec::new();
        if let Some(participant) = &options.participant {
            if !jid.is_group() && !jid.is_status_broadcast() {
                stanza_attrs.insert("device_fanout".into(), "false".into());
            }
            devices.push(DeviceTarget::from_jid(participant.jid.clone()));
        }

        if jid.is_newsletter() {
            return self
                .relay_to_newsletter(jid, message, message_id, &stanza_attrs)
                .await;
        }

        let mut enc_attrs = Attrs::new();
        if let Some(media_type) = message.media_type() {
            enc_attrs.insert("mediatype".into(), media_type.into());
        }
        if message.hides_decrypt_failure() {
            enc_attrs.insert("decrypt-fail".into(), "hide".into());
        }
        if let Some(name) = message.native_flow_response_name() {
            enc_attrs.insert("native_flow_name".into(), name.to_string());
        }

        let is_peer = stanza_attrs.get("category").map(String::as_str) == Some("peer");
        let composed = if jid.is_group() || jid.is_status_broadcast() {
            self.compose_group(request, devices, &mut stanza_attrs, &enc_attrs)
                .await?
        } else {
            self.compose_direct(request, devices, is_peer, &enc_attrs)
                .await?
        };

        let device_count = composed.participants.len();
        let mut children = composed.content;
        if !composed.participants.is_empty() {
            if is_peer {
                let enc = composed
                    .participants
                    .first()
                    .and_then(|to| to.child_nodes().first())
                    .cloned();
                children.extend(enc);
            } else {
                children.push(Node::new("participants").children(composed.participants));
            }
        }

        let mut stanza = Node::new("message")
            .attr("id", message_id)
            .attr("type", message.message_type().as_str())
            .attr("to", jid.to_string())
            .attrs(&stanza_attrs);
        if let Some(participant) = &options.participant {
            let target = participant.jid.to_string();
            stanza = if jid.is_group() {
                stanza.attr("participant", target)
            } else if account.is_own_user(&participant.jid.user) {
                stanza.attr("to", target).attr("recipient", jid.to_string())
            } else {
                stanza.attr("to", target)
            };
        }

        if composed.include_device_identity {
            children.push(Node::new("device-identity").bytes(account.device_identity.clone()));
            debug!("Adding device identity");
        }

        let additional = &options.additional_nodes;
        let caller_has_business = has_business_node(additional);
        let mut pushed_additional = false;
        if options.ai && jid.server == Server::Pn {
            if caller_has_business {
                children.extend(additional.iter().cloned());
                pushed_additional = true;
            } else {
                children.push(bot_node());
            }
        }
        if let Some(button_type) = message.button_type().filter(|_| !jid.is_status_broadcast()) {
            if caller_has_business {
                if !pushed_additional {
                    children.extend(additional.iter().cloned());
                    pushed_additional = true;
                }
            } else {
                children.extend(business_nodes(button_type));
            }
            debug!(button_type = button_type.as_str(), "Adding business node");
        }
        if !pushed_additional {
            children.extend(additional.iter().cloned());
        }

        debug!(message_id, "Sending message to {} devices", device_count);
        self.server.send_node(stanza.children(children)).await?;

        if options.participant.is_none() && self.config.enable_recent_message_cache {
            self.retry
                .add_recent_message(jid, message_id, message.clone());
        }
        Ok(())
    }

    async fn relay_to_newsletter(
        &self,
        jid: &Jid,
        message: &Message,
        message_id: &str,
        stanza_attrs: &Attrs,
    ) -> Result<()> {
        let patched = self.patch_single(message).await?;
        let mut plaintext = Node::new("plaintext");
        if let Some(media_type) = message.media_type() {
            plaintext = plaintext.attr("mediatype", media_type);
        }
        let stanza = Node::new("message")
            .attr("to", jid.to_string())
            .attr("id", message_id)
            .attr("type", message.message_type().as_str())
            .attrs(stanza_attrs)
            .children(vec![plaintext.bytes(encode_plaintext(&patched)?)]);

        debug!(message_id, "Sending newsletter message");
        self.server.send_node(stanza).await
    }

    async fn compose_group(
        &self,
        request: RelayRequest<'_>,
        mut devices: Vec<DeviceTarget>,
        stanza_attrs: &mut Attrs,
        enc_attrs: &Attrs,
    ) -> Result<Composed> {
        let RelayRequest {
            jid,
            message,
            options,
            account,
            ..
        } = request;
        let is_status = jid.is_status_broadcast();
        let is_retry_resend = options.participant.is_some();

        let load_metadata = async {
            if is_status {
                Ok(None)
            } else {
                self.group_metadata(jid, options.use_cached_group_metadata)
                    .await
                    .map(Some)
            }
        };
        let load_memory = async {
            if is_retry_resend || is_status {
                Ok(SenderKeyMemory::new())
            } else {
                self.sender_key_memory(jid).await
            }
        };
        let (metadata, memory) = futures::join!(load_metadata, load_memory);
        let metadata: Option<GroupMetadata> = metadata?;
        let mut memory = memory?;

        if !is_retry_resend {
            let mut members: Vec<Jid> = metadata
                .as_ref()
                .map(|meta| meta.participants.clone())
                .unwrap_or_default();
            if is_status {
                members.extend(options.status_jid_list.iter().cloned());
            }
            let discovered = self
                .devices
                .get_devices(account, &members, options.use_user_devices_cache, false)
                .await?;
            devices.extend(discovered);
        }

        if let Some(duration) = metadata
            .as_ref()
            .and_then(|meta| meta.ephemeral_duration)
            .filter(|d| *d > 0)
        {
            stanza_attrs.insert("expiration".into(), duration.to_string());
        }

        let patched = self.patch_single(message).await?;
        let bytes = encode_message(&patched)?;

        let addressing_mode = stanza_attrs
            .get("addressing_mode")
            .and_then(|mode| AddressingMode::parse(mode))
            .or_else(|| metadata.as_ref().map(|meta| meta.addressing_mode))
            .unwrap_or_default();
        let sender = match (addressing_mode, &account.lid) {
            (AddressingMode::Lid, Some(lid)) => lid.clone(),
            _ => account.id.clone(),
        };
        let group_encryption = self
            .signal
            .encrypt_group_message(jid, &bytes, &sender)
            .await?;

        let mut distribution_targets = Vec::new();
        for device in &devices {
            let key = device.jid.to_string();
            let has_key = memory.get(&key).copied().unwrap_or(false);
            if (!has_key || is_retry_resend)
                && !device.jid.is_hosted()
                && device.device != HOSTED_DEVICE
            {
                distribution_targets.push(device.jid.clone());
                memory.insert(key, true);
            }
        }

        let mut composed = Composed::default();
        if !distribution_targets.is_empty() {
            debug!("Sending sender key to {} devices", distribution_targets.len());
            let distribution = Message::new(MessageContent::SenderKeyDistribution {
                group_id: jid.clone(),
                distribution: group_encryption.sender_key_distribution.clone(),
            });
            self.assert_sessions(&distribution_targets).await?;
            let nodes = self
                .create_participant_nodes(account, &distribution_targets, &distribution, enc_attrs, None)
                .await?;
            composed.include_device_identity = nodes.include_device_identity;
            composed.participants = nodes.nodes;
        }

        match &options.participant {
            Some(participant) => {
                let encrypted = self.encrypt_for(&participant.jid, &bytes).await?;
                composed.include_device_identity |= encrypted.kind.requires_device_identity();
                composed.content.push(
                    Node::new("enc")
                        .attr("v", ENC_VERSION)
                        .attr("type", encrypted.kind.as_str())
                        .attr("count", participant.count.to_string())
                        .bytes(encrypted.ciphertext),
                );
            }
            None => {
                composed.content.push(
                    Node::new("enc")
                        .attr("v", ENC_VERSION)
                        .attr("type", "skmsg")
                        .attrs(enc_attrs)
                        .bytes(group_encryption.ciphertext),
                );
                let memory_value = encode_value(&memory)?;
                self.keys
                    .set(HashMap::from([(
                        KeyCategory::SenderKeyMemory,
                        HashMap::from([(jid.to_string(), Some(memory_value))]),
                    )]))
                    .await?;
            }
        }

        Ok(composed)
    }

    async fn compose_direct(
        &self,
        request: RelayRequest<'_>,
        mut devices: Vec<DeviceTarget>,
        is_peer: bool,
        enc_attrs: &Attrs,
    ) -> Result<Composed> {
        let RelayRequest {
            jid,
            message,
            options,
            account,
            ..
        } = request;

        if options.participant.is_none() {
            let own_lid = account.lid.as_ref().filter(|_| jid.is_lid());
            if is_peer {
                let server = if jid.is_lid() { Server::Lid } else { Server::Pn };
                let own_user = own_lid.map_or(&account.id.user, |lid| &lid.user);
                devices.push(DeviceTarget::from_jid(Jid::device(jid.user.clone(), 0, server)));
                if jid.user != *own_user {
                    devices.push(DeviceTarget::from_jid(Jid::device(own_user.clone(), 0, server)));
                }
            } else {
                let sender_identity = match own_lid {
                    Some(lid) => Jid::lid(lid.user.clone()),
                    None => Jid::pn(account.id.user.clone()),
                };
                let discovered = self
                    .devices
                    .get_devices(account, &[sender_identity, jid.clone()], true, false)
                    .await?;
                devices.extend(discovered);
            }
        }

        let mut own_devices = Vec::new();
        let mut other_devices = Vec::new();
        let mut all_devices = Vec::new();
        for device in devices {
            if account.is_exact_device(&device.jid) {
                trace!(jid = %device.jid, "Skipping sending device");
                continue;
            }
            all_devices.push(device.jid.clone());
            if account.is_own_user(&device.user) {
                own_devices.push(device.jid);
            } else {
                other_devices.push(device.jid);
            }
        }

        self.assert_sessions(&all_devices).await?;

        let device_sent = Message {
            content: MessageContent::DeviceSent {
                destination: jid.clone(),
                message: Box::new(message.clone()),
            },
            context_info: message.context_info.clone(),
        };
        let (own, others) = futures::try_join!(
            self.create_participant_nodes(account, &own_devices, &device_sent, enc_attrs, None),
            self.create_participant_nodes(account, &other_devices, message, enc_attrs, Some(&device_sent)),
        )?;

        let mut participants = own.nodes;
        participants.extend(others.nodes);
        Ok(Composed {
            participants,
            content: Vec::new(),
            include_device_identity: own.include_device_identity || others.include_device_identity,
        })
    }

    /// Encrypt `message` for each of `recipients`.
    ///
    /// Own devices other than this one get `device_sent` instead when given.
    pub async fn create_participant_nodes(
        &self,
        account: &Account,
        recipients: &[Jid],
        message: &Message,
        enc_attrs: &Attrs,
        device_sent: Option<&Message>,
    ) -> Result<ParticipantNodes> {
        if recipients.is_empty() {
            return Ok(ParticipantNodes::default());
        }

        let variants: Vec<(Jid, Message)> = match self.patch(message, recipients).await? {
            PatchedMessage::Single(patched) => recipients
                .iter()
                .map(|jid| (jid.clone(), patched.clone()))
                .collect(),
            PatchedMessage::PerRecipient(variants) => variants,
        };

        let encryptions = variants.into_iter().map(|(jid, variant)| async move {
            let payload = match device_sent {
                Some(dsm) if account.is_own_user(&jid.user) && !account.is_exact_device(&jid) => dsm,
                _ => &variant,
            };
            let bytes = encode_message(payload)?;
            let encrypted = self.encrypt_for(&jid, &bytes).await?;
            let requires_identity = encrypted.kind.requires_device_identity();
            let enc = Node::new("enc")
                .attr("v", ENC_VERSION)
                .attr("type", encrypted.kind.as_str())
                .attrs(enc_attrs)
                .bytes(encrypted.ciphertext);
            let node = Node::new("to")
                .attr("jid", jid.to_string())
                .children(vec![enc]);
            Ok::<_, ProtocolError>((node, requires_identity))
        });

        let mut result = ParticipantNodes::default();
        for (node, requires_identity) in try_join_all(encryptions).await? {
            result.include_device_identity |= requires_identity;
            result.nodes.push(node);
        }
        Ok(result)
    }

    /// Establish missing sessions for `jids`. Returns whether a
    /// session-establishment query was issued.
    #[instrument(skip(self, jids), fields(count = jids.len()))]
    pub async fn assert_sessions(&self, jids: &[Jid]) -> Result<bool> {
        self.sessions.assert_sessions(jids).await
    }

    /// Device targets for `jids`
    pub async fn get_devices(
        &self,
        jids: &[Jid],
        use_cache: bool,
        ignore_zero_devices: bool,
    ) -> Result<Vec<DeviceTarget>> {
        let account = self.current_account()?;
        self.devices
            .get_devices(&account, jids, use_cache, ignore_zero_devices)
            .await
    }

    /// Send a receipt for `message_ids` in `jid`
    #[instrument(skip(self, message_ids), fields(to = %jid))]
    pub async fn send_receipt(
        &self,
        jid: &Jid,
        participant: Option<&Jid>,
        message_ids: &[String],
        receipt_type: Option<ReceiptType>,
    ) -> Result<()> {
        let node = build_receipt(jid, participant, message_ids, receipt_type)?;
        debug!(
            receipt_type = receipt_type.map(|t| t.as_str()),
            "Sending receipt for {} messages",
            message_ids.len()
        );
        self.server.send_node(node).await
    }

    /// Send one receipt per chat and author for messages not sent by us
    pub async fn send_receipts(&self, keys: &[MessageKey], receipt_type: Option<ReceiptType>) -> Result<()> {
        for batch in aggregate_message_keys_not_from_me(keys) {
            self.send_receipt(&batch.jid, batch.participant.as_ref(), &batch.message_ids, receipt_type)
                .await?;
        }
        Ok(())
    }

    /// Mark messages read. Without read receipts the other side is not told.
    pub async fn read_messages(&self, keys: &[MessageKey], send_read_receipts: bool) -> Result<()> {
        let receipt_type = if send_read_receipts {
            ReceiptType::Read
        } else {
            ReceiptType::ReadSelf
        };
        self.send_receipts(keys, Some(receipt_type)).await
    }

    /// Send a request to this account's own devices. Returns the message id.
    pub async fn send_peer_data_operation_message(
        &self,
        request: PeerDataOperationRequest,
    ) -> Result<String> {
        let account = self.current_account()?;
        let me = account.id.to_user_jid();
        let message = Message::new(MessageContent::Protocol(
            ProtocolMessage::PeerDataOperationRequest(request),
        ));
        let options = RelayOptions {
            additional_attributes: Attrs::from([
                ("category".to_string(), "peer".to_string()),
                ("push_priority".to_string(), "high_force".to_string()),
            ]),
            additional_nodes: vec![Node::new("meta").attr("appdata", "default")],
            ..RelayOptions::default()
        };
        self.relay_message(&me, &message, options).await
    }

    async fn encrypt_for(&self, jid: &Jid, bytes: &[u8]) -> Result<EncryptedMessage> {
        self.encryption_locks
            .run_exclusive(&jid.to_string(), self.signal.encrypt_message(jid, bytes))
            .await
    }

    async fn patch(&self, message: &Message, recipients: &[Jid]) -> Result<PatchedMessage> {
        match &self.patcher {
            Some(patcher) => patcher.patch(message, recipients).await,
            None => Ok(PatchedMessage::Single(message.clone())),
        }
    }

    async fn patch_single(&self, message: &Message) -> Result<Message> {
        match self.patch(message, &[]).await? {
            PatchedMessage::Single(patched) => Ok(patched),
            PatchedMessage::PerRecipient(_) => Err(ProtocolError::PerJidPatchInGroup),
        }
    }

    async fn group_metadata(&self, jid: &Jid, use_cache: bool) -> Result<GroupMetadata> {
        if use_cache {
            if let Some(cache) = &self.group_cache {
                if let Some(metadata) = cache.get(jid).await {
                    trace!(group = %jid, "Using cached group metadata");
                    return Ok(metadata);
                }
            }
        }
        self.server.group_metadata(jid).await
    }

    async fn sender_key_memory(&self, jid: &Jid) -> Result<SenderKeyMemory> {
        let id = jid.to_string();
        let stored = self
            .keys
            .get(KeyCategory::SenderKeyMemory, std::slice::from_ref(&id))
            .await?;
        match stored.get(&id) {
            Some(value) => Ok(decode_value(KeyCategory::SenderKeyMemory, &id, value)?),
            None => Ok(SenderKeyMemory::new()),
        }
    }
}
