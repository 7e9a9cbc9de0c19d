//! End-to-end relay behaviour against in-memory collaborators

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{account, MockServer, MockSignal};
use tessera_core::message::{ButtonType, MediaInfo, PeerDataOperationRequest, PeerDataOperationType};
use tessera_core::storage::memory::MemoryKeyStore;
use tessera_core::storage::{KeyCategory, KeyStore};
use tessera_core::{Jid, Message, MessageContent, Server};
use tessera_protocol::encoding::decode_message;
use tessera_protocol::envelope::business_nodes;
use tessera_protocol::network::{AddressingMode, GroupMetadata};
use tessera_protocol::relay::{MessagePatcher, PatchedMessage};
use tessera_protocol::{
    ClientConfig, Node, ProtocolError, RelayEngine, RelayOptions, Result, RetryParticipant,
};

fn engine(signal: &Arc<MockSignal>, server: &Arc<MockServer>) -> (RelayEngine, Arc<MemoryKeyStore>) {
    let store = Arc::new(MemoryKeyStore::new());
    let engine = RelayEngine::new(
        ClientConfig::default(),
        store.clone(),
        signal.clone(),
        server.clone(),
    )
    .unwrap();
    engine.set_account(account());
    (engine, store)
}

fn pn_device(user: &str, device: u16) -> Jid {
    Jid::device(user, device, Server::Pn)
}

fn recipients(stanza: &Node) -> Vec<String> {
    stanza
        .child("participants")
        .map(|p| {
            p.child_nodes()
                .iter()
                .map(|to| to.get_attr("jid").unwrap().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn payload_for(stanza: &Node, jid: &str) -> Message {
    let to = stanza
        .child("participants")
        .unwrap()
        .child_nodes()
        .iter()
        .find(|to| to.get_attr("jid") == Some(jid))
        .unwrap();
    decode_message(to.child("enc").unwrap().payload().unwrap()).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_assert_sessions_fetches_only_missing_devices() {
    let a = pn_device("200", 1);
    let b = Jid::device("300", 2, Server::Lid);
    let signal = Arc::new(MockSignal::with_sessions(&[a.clone()]));
    let server = Arc::new(MockServer::new());
    let (engine, _) = engine(&signal, &server);

    let fetched = engine.assert_sessions(&[a.clone(), b.clone(), b.clone()]).await.unwrap();

    assert!(fetched);
    assert_eq!(*server.prekey_fetches.lock(), vec![vec![b.clone()]]);

    // Presence is cached now, including the fetched device
    let validations = signal.validations.load(Ordering::SeqCst);
    assert!(!engine.assert_sessions(&[a, b]).await.unwrap());
    assert_eq!(server.prekey_fetches.lock().len(), 1);
    assert_eq!(signal.validations.load(Ordering::SeqCst), validations);
}

#[test_log::test(tokio::test)]
async fn test_assert_sessions_prefers_linked_address() {
    let mapped = pn_device("400", 2);
    let unmapped = pn_device("500", 0);
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    server.add_lid("400", "800");
    let (engine, store) = engine(&signal, &server);

    assert!(engine.assert_sessions(&[mapped, unmapped.clone()]).await.unwrap());

    let fetches = server.prekey_fetches.lock().clone();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0], vec![Jid::device("800", 2, Server::Lid), unmapped]);
    assert_eq!(server.lid_resolutions.load(Ordering::SeqCst), 1);

    let stored = store.snapshot();
    assert_eq!(stored[&KeyCategory::LidMapping]["400"], json!("800"));
    assert_eq!(stored[&KeyCategory::LidMapping]["800_reverse"], json!("400"));
}

#[test_log::test(tokio::test)]
async fn test_mapped_device_fetched_once() {
    let mapped = pn_device("400", 2);
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    server.add_lid("400", "800");
    let (engine, _) = engine(&signal, &server);

    assert!(engine.assert_sessions(&[mapped.clone()]).await.unwrap());
    assert!(!engine.assert_sessions(&[mapped.clone()]).await.unwrap());
    assert!(!engine.assert_sessions(&[mapped]).await.unwrap());

    assert_eq!(
        *server.prekey_fetches.lock(),
        vec![vec![Jid::device("800", 2, Server::Lid)]]
    );
}

#[test_log::test(tokio::test)]
async fn test_group_sender_key_goes_only_to_devices_without_it() {
    let group = Jid::group("120363-1");
    let members = ["200", "300", "400"];
    let signal = Arc::new(MockSignal::with_sessions(
        &members.iter().map(|u| pn_device(u, 0)).collect::<Vec<_>>(),
    ));
    let server = Arc::new(MockServer::new());
    for user in members {
        server.add_user(Jid::pn(user), &[0]);
    }
    server.add_group(GroupMetadata {
        id: group.clone(),
        participants: members.iter().map(|u| Jid::pn(*u)).collect(),
        addressing_mode: AddressingMode::Pn,
        ephemeral_duration: Some(86400),
    });
    let (engine, store) = engine(&signal, &server);
    store
        .set(HashMap::from([(
            KeyCategory::SenderKeyMemory,
            HashMap::from([(
                group.to_string(),
                Some(json!({ "200@s.whatsapp.net": true, "300@s.whatsapp.net": true })),
            )]),
        )]))
        .await
        .unwrap();

    engine
        .relay_message(&group, &Message::text("hello"), RelayOptions::default())
        .await
        .unwrap();

    let stanza = server.last_sent();
    assert_eq!(stanza.get_attr("to"), Some("120363-1@g.us"));
    assert_eq!(stanza.get_attr("expiration"), Some("86400"));
    assert_eq!(recipients(&stanza), vec!["400@s.whatsapp.net"]);
    assert!(matches!(
        payload_for(&stanza, "400@s.whatsapp.net").content,
        MessageContent::SenderKeyDistribution { .. }
    ));

    let skmsg = stanza.child("enc").unwrap();
    assert_eq!(skmsg.get_attr("type"), Some("skmsg"));
    assert_eq!(decode_message(skmsg.payload().unwrap()).unwrap(), Message::text("hello"));
    assert!(stanza.child("device-identity").is_none());

    let memory = &store.snapshot()[&KeyCategory::SenderKeyMemory][&group.to_string()];
    assert_eq!(
        memory,
        &json!({
            "200@s.whatsapp.net": true,
            "300@s.whatsapp.net": true,
            "400@s.whatsapp.net": true
        })
    );
}

#[test_log::test(tokio::test)]
async fn test_direct_message_fans_out_to_all_other_devices() {
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    server.add_user(Jid::pn("100"), &[0, 1, 2]);
    server.add_user(Jid::pn("200"), &[0, 5]);
    let (engine, store) = engine(&signal, &server);
    let to = Jid::pn("200");

    let id = engine
        .relay_message(&to, &Message::text("hi"), RelayOptions::default())
        .await
        .unwrap();

    assert!(id.starts_with("3EB0"));
    let stanza = server.last_sent();
    assert_eq!(stanza.get_attr("id"), Some(id.as_str()));
    assert_eq!(stanza.get_attr("to"), Some("200@s.whatsapp.net"));
    assert_eq!(stanza.get_attr("type"), Some("text"));

    let mut jids = recipients(&stanza);
    jids.sort();
    assert_eq!(
        jids,
        vec![
            "100:2@s.whatsapp.net",
            "100@s.whatsapp.net",
            "200:5@s.whatsapp.net",
            "200@s.whatsapp.net",
        ]
    );

    match payload_for(&stanza, "100:2@s.whatsapp.net").content {
        MessageContent::DeviceSent { destination, message } => {
            assert_eq!(destination, to);
            assert_eq!(*message, Message::text("hi"));
        }
        other => panic!("expected device-sent copy, got {:?}", other),
    }
    assert_eq!(payload_for(&stanza, "200:5@s.whatsapp.net"), Message::text("hi"));

    // Fresh sessions mean first-message ciphertexts and an identity proof
    let enc = stanza.child("participants").unwrap().child_nodes()[0].child("enc").unwrap();
    assert_eq!(enc.get_attr("type"), Some("pkmsg"));
    assert_eq!(
        stanza.child("device-identity").unwrap().payload(),
        Some(&b"signed-identity"[..])
    );

    assert_eq!(server.prekey_fetches.lock().len(), 1);
    assert!(!signal.encrypted_for.lock().contains(&pn_device("100", 1)));
    assert!(engine.retry_manager().get_recent_message(&to, &id).is_some());

    let device_lists = &store.snapshot()[&KeyCategory::DeviceList];
    assert_eq!(device_lists["100"], json!(["0", "2"]));
    assert_eq!(device_lists["200"], json!(["0", "5"]));
    assert_eq!(engine.active_encryption_locks(), 0);
}

#[test_log::test(tokio::test)]
async fn test_failed_send_leaves_no_cached_discovery() {
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    server.add_user(Jid::pn("100"), &[0]);
    server.add_user(Jid::pn("200"), &[0]);
    server.report_lid("200", "700");
    let (engine, store) = engine(&signal, &server);
    let to = Jid::pn("200");

    server.fail_sends.store(true, Ordering::SeqCst);
    let err = engine
        .relay_message(&to, &Message::text("hi"), RelayOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Network(_)));

    let stored = store.snapshot();
    assert_eq!(stored.get(&KeyCategory::LidMapping).map_or(0, |m| m.len()), 0);
    assert_eq!(stored.get(&KeyCategory::DeviceList).map_or(0, |m| m.len()), 0);
    assert_eq!(engine.lid_mapping().get_lid_for_pn(&to).await.unwrap(), None);

    server.fail_sends.store(false, Ordering::SeqCst);
    engine
        .relay_message(&to, &Message::text("hi"), RelayOptions::default())
        .await
        .unwrap();

    // Discovery ran again and its results landed this time
    assert_eq!(server.device_fetches.lock().len(), 2);
    let stored = store.snapshot();
    assert_eq!(stored[&KeyCategory::LidMapping]["200"], json!("700"));
    assert_eq!(stored[&KeyCategory::LidMapping]["700_reverse"], json!("200"));
    assert_eq!(stored[&KeyCategory::DeviceList]["200"], json!(["0"]));
    assert_eq!(engine.active_encryption_locks(), 0);
}

#[test_log::test(tokio::test)]
async fn test_user_devices_served_from_cache() {
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    server.add_user(Jid::pn("100"), &[0]);
    server.add_user(Jid::pn("200"), &[0]);
    let (engine, _) = engine(&signal, &server);

    for text in ["one", "two"] {
        engine
            .relay_message(&Jid::pn("200"), &Message::text(text), RelayOptions::default())
            .await
            .unwrap();
    }

    assert_eq!(server.device_fetches.lock().len(), 1);
    assert_eq!(server.sent.lock().len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_newsletter_is_sent_in_plaintext() {
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    let (engine, _) = engine(&signal, &server);
    let channel = Jid::new("120363-9", Server::Newsletter);
    let image = Message::new(MessageContent::Image(MediaInfo::default()));

    let id = engine
        .relay_message(&channel, &image, RelayOptions::default())
        .await
        .unwrap();

    let stanza = server.last_sent();
    assert_eq!(stanza.get_attr("type"), Some("media"));
    let plaintext = stanza.child("plaintext").unwrap();
    assert_eq!(plaintext.get_attr("mediatype"), Some("image"));
    assert!(stanza.child("enc").is_none());
    assert!(signal.encrypted_for.lock().is_empty());
    assert!(server.prekey_fetches.lock().is_empty());
    assert!(engine.retry_manager().get_recent_message(&channel, &id).is_none());
}

#[test_log::test(tokio::test)]
async fn test_status_broadcast_uses_explicit_recipients() {
    let signal = Arc::new(MockSignal::with_sessions(&[pn_device("200", 0)]));
    let server = Arc::new(MockServer::new());
    server.add_user(Jid::pn("200"), &[0]);
    let (engine, _) = engine(&signal, &server);

    let options = RelayOptions {
        status_jid_list: vec![Jid::pn("200")],
        ..RelayOptions::default()
    };
    engine
        .relay_message(&Jid::status_broadcast(), &Message::text("story"), options)
        .await
        .unwrap();

    let stanza = server.last_sent();
    assert_eq!(stanza.get_attr("to"), Some("status@broadcast"));
    assert_eq!(recipients(&stanza), vec!["200@s.whatsapp.net"]);
    assert_eq!(stanza.child("enc").unwrap().get_attr("type"), Some("skmsg"));
}

#[test_log::test(tokio::test)]
async fn test_retry_resend_targets_single_device() {
    let device = pn_device("200", 5);
    let signal = Arc::new(MockSignal::with_sessions(&[device.clone()]));
    let server = Arc::new(MockServer::new());
    let (engine, _) = engine(&signal, &server);

    let options = RelayOptions {
        message_id: Some("3EB0RESEND".into()),
        participant: Some(RetryParticipant {
            jid: device.clone(),
            count: 2,
        }),
        ..RelayOptions::default()
    };
    engine
        .relay_message(&Jid::pn("200"), &Message::text("again"), options)
        .await
        .unwrap();

    let stanza = server.last_sent();
    assert_eq!(stanza.get_attr("id"), Some("3EB0RESEND"));
    assert_eq!(stanza.get_attr("device_fanout"), Some("false"));
    assert_eq!(stanza.get_attr("to"), Some("200:5@s.whatsapp.net"));
    assert_eq!(recipients(&stanza), vec!["200:5@s.whatsapp.net"]);
    assert_eq!(*signal.encrypted_for.lock(), vec![device]);
    assert!(server.device_fetches.lock().is_empty());
    assert!(engine
        .retry_manager()
        .get_recent_message(&Jid::pn("200"), "3EB0RESEND")
        .is_none());
}

#[test_log::test(tokio::test)]
async fn test_peer_data_operation_embeds_single_ciphertext() {
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    let (engine, _) = engine(&signal, &server);

    engine
        .send_peer_data_operation_message(PeerDataOperationRequest {
            request_type: PeerDataOperationType::PlaceholderMessageResend,
            message_ids: vec!["ABC".into()],
        })
        .await
        .unwrap();

    let stanza = server.last_sent();
    assert_eq!(stanza.get_attr("to"), Some("100@s.whatsapp.net"));
    assert_eq!(stanza.get_attr("category"), Some("peer"));
    assert_eq!(stanza.get_attr("push_priority"), Some("high_force"));
    assert!(stanza.child("participants").is_none());
    assert!(stanza.child("enc").is_some());
    assert_eq!(stanza.child("meta").unwrap().get_attr("appdata"), Some("default"));
    assert!(server.device_fetches.lock().is_empty());
    assert_eq!(*signal.encrypted_for.lock(), vec![pn_device("100", 0)]);
}

#[tokio::test]
async fn test_peer_data_operation_requires_account() {
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    let (engine, _) = engine(&signal, &server);
    engine.clear_account();

    let err = engine
        .send_peer_data_operation_message(PeerDataOperationRequest {
            request_type: PeerDataOperationType::HistorySyncOnDemand,
            message_ids: vec![],
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::NotAuthenticated));
    assert!(server.sent.lock().is_empty());
}

#[tokio::test]
async fn test_receipt_without_ids_is_rejected() {
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    let (engine, _) = engine(&signal, &server);

    let err = engine
        .send_receipt(&Jid::pn("200"), None, &[], None)
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::MissingReceiptIds));
    assert!(server.sent.lock().is_empty());
}

#[tokio::test]
async fn test_read_messages_batches_per_author() {
    use tessera_protocol::MessageKey;

    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    let (engine, _) = engine(&signal, &server);
    let chat = Jid::pn("200");
    let key = |id: &str, from_me: bool| MessageKey {
        remote_jid: chat.clone(),
        from_me,
        id: id.to_string(),
        participant: None,
    };

    engine
        .read_messages(&[key("1", false), key("2", true), key("3", false)], true)
        .await
        .unwrap();

    let sent = server.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].get_attr("type"), Some("read"));
    assert_eq!(sent[0].get_attr("id"), Some("1"));
    assert_eq!(sent[0].child("list").unwrap().child_nodes().len(), 1);
}

struct PerRecipientPatcher;

#[async_trait]
impl MessagePatcher for PerRecipientPatcher {
    async fn patch(&self, message: &Message, recipients: &[Jid]) -> Result<PatchedMessage> {
        Ok(PatchedMessage::PerRecipient(
            recipients
                .iter()
                .map(|jid| (jid.clone(), message.clone()))
                .collect(),
        ))
    }
}

#[tokio::test]
async fn test_group_rejects_per_recipient_patch() {
    let group = Jid::group("120363-2");
    let signal = Arc::new(MockSignal::new());
    let server = Arc::new(MockServer::new());
    server.add_group(GroupMetadata {
        id: group.clone(),
        participants: vec![],
        addressing_mode: AddressingMode::Lid,
        ephemeral_duration: None,
    });
    let (engine, store) = engine(&signal, &server);
    let engine = engine.with_patcher(Arc::new(PerRecipientPatcher));

    let err = engine
        .relay_message(&group, &Message::text("x"), RelayOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::PerJidPatchInGroup));
    assert!(server.sent.lock().is_empty());
    assert_eq!(store.count(KeyCategory::SenderKeyMemory), 0);
}

#[tokio::test]
async fn test_business_node_not_duplicated() {
    let signal = Arc::new(MockSignal::with_sessions(&[pn_device("200", 0)]));
    let server = Arc::new(MockServer::new());
    server.add_user(Jid::pn("200"), &[0]);
    let (engine, _) = engine(&signal, &server);
    let list = Message::new(MessageContent::List {
        title: "menu".into(),
        sections: vec!["mains".into()],
    });

    engine
        .relay_message(&Jid::pn("200"), &list, RelayOptions::default())
        .await
        .unwrap();
    let generated = server.last_sent();
    let biz: Vec<_> = generated.child_nodes().iter().filter(|n| n.tag == "biz").collect();
    assert_eq!(biz.len(), 1);
    assert!(biz[0].child("list").is_some());

    let options = RelayOptions {
        additional_nodes: business_nodes(ButtonType::Buttons),
        ..RelayOptions::default()
    };
    engine
        .relay_message(&Jid::pn("200"), &list, options)
        .await
        .unwrap();
    let supplied = server.last_sent();
    let biz: Vec<_> = supplied.child_nodes().iter().filter(|n| n.tag == "biz").collect();
    assert_eq!(biz.len(), 1);
    assert!(biz[0].child("interactive").is_some());
}
