//! Receipt stanzas

use serde::{Deserialize, Serialize};

use tessera_core::Jid;

use crate::encoding::unix_timestamp_secs;
use crate::envelope::Node;
use crate::error::{ProtocolError, Result};

/// Receipt kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiptType {
    /// Message read
    Read,
    /// Read, with read receipts disabled
    ReadSelf,
    /// Media played
    Played,
    /// Acknowledges a message sent from another of our devices
    Sender,
    /// Delivered while inactive
    Inactive,
    /// Decryption failed, ask for a resend
    Retry,
    /// Peer message acknowledgement
    PeerMsg,
    /// History sync acknowledgement
    HistSync,
}

impl ReceiptType {
    /// Wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptType::Read => "read",
            ReceiptType::ReadSelf => "read-self",
            ReceiptType::Played => "played",
            ReceiptType::Sender => "sender",
            ReceiptType::Inactive => "inactive",
            ReceiptType::Retry => "retry",
            ReceiptType::PeerMsg => "peer_msg",
            ReceiptType::HistSync => "hist_sync",
        }
    }

    /// Receipt carries a timestamp
    pub fn is_read(&self) -> bool {
        matches!(self, ReceiptType::Read | ReceiptType::ReadSelf)
    }
}

/// Key of a received or sent message
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    /// Chat the message belongs to
    pub remote_jid: Jid,
    /// Sent by this account
    pub from_me: bool,
    /// Message id
    pub id: String,
    /// Author within a group
    pub participant: Option<Jid>,
}

/// Message ids of one chat and author
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiptBatch {
    /// Chat
    pub jid: Jid,
    /// Author within a group
    pub participant: Option<Jid>,
    /// Ids, in the order given
    pub message_ids: Vec<String>,
}

/// Compose a receipt stanza. The first id goes in the attributes; the rest
/// are listed as children.
pub fn build_receipt(
    jid: &Jid,
    participant: Option<&Jid>,
    message_ids: &[String],
    receipt_type: Option<ReceiptType>,
) -> Result<Node> {
    let Some((first, rest)) = message_ids.split_first() else {
        return Err(ProtocolError::MissingReceiptIds);
    };

    let mut node = Node::new("receipt").attr("id", first.as_str());
    if receipt_type.is_some_and(|t| t.is_read()) {
        node = node.attr("t", unix_timestamp_secs().to_string());
    }

    match participant {
        Some(participant)
            if receipt_type == Some(ReceiptType::Sender)
                && (jid.is_pn_class() || jid.is_lid_class()) =>
        {
            node = node
                .attr("recipient", jid.to_string())
                .attr("to", participant.to_string());
        }
        _ => {
            node = node.attr("to", jid.to_string());
            if let Some(participant) = participant {
                node = node.attr("participant", participant.to_string());
            }
        }
    }

    if let Some(receipt_type) = receipt_type {
        node = node.attr("type", receipt_type.as_str());
    }

    if !rest.is_empty() {
        let items = rest
            .iter()
            .map(|id| Node::new("item").attr("id", id.as_str()))
            .collect();
        node = node.children(vec![Node::new("list").children(items)]);
    }

    Ok(node)
}

/// Group keys of messages not sent by this account per chat and author
pub fn aggregate_message_keys_not_from_me(keys: &[MessageKey]) -> Vec<ReceiptBatch> {
    let mut batches: Vec<ReceiptBatch> = Vec::new();
    for key in keys.iter().filter(|key| !key.from_me) {
        let existing = batches
            .iter_mut()
            .find(|b| b.jid == key.remote_jid && b.participant == key.participant);
        match existing {
            Some(batch) => batch.message_ids.push(key.id.clone()),
            None => batches.push(ReceiptBatch {
                jid: key.remote_jid.clone(),
                participant: key.participant.clone(),
                message_ids: vec![key.id.clone()],
            }),
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_empty_ids_rejected() {
        let err = build_receipt(&Jid::pn("1"), None, &[], None).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingReceiptIds));
    }

    #[test]
    fn test_read_receipt_lists_extra_ids() {
        let group = Jid::group("123-456");
        let author = Jid::pn("7");
        let node = build_receipt(&group, Some(&author), &ids(&["A", "B", "C"]), Some(ReceiptType::Read)).unwrap();

        assert_eq!(node.get_attr("id"), Some("A"));
        assert_eq!(node.get_attr("to"), Some("123-456@g.us"));
        assert_eq!(node.get_attr("participant"), Some("7@s.whatsapp.net"));
        assert_eq!(node.get_attr("type"), Some("read"));
        assert!(node.get_attr("t").is_some());

        let items: Vec<_> = node
            .child("list")
            .unwrap()
            .child_nodes()
            .iter()
            .map(|n| n.get_attr("id").unwrap())
            .collect();
        assert_eq!(items, vec!["B", "C"]);
    }

    #[test]
    fn test_sender_receipt_swaps_addresses() {
        let chat = Jid::pn("5");
        let me = Jid::device("9", 1, tessera_core::Server::Pn);
        let node = build_receipt(&chat, Some(&me), &ids(&["X"]), Some(ReceiptType::Sender)).unwrap();

        assert_eq!(node.get_attr("recipient"), Some("5@s.whatsapp.net"));
        assert_eq!(node.get_attr("to"), Some("9:1@s.whatsapp.net"));
        assert!(node.get_attr("participant").is_none());
        assert!(node.get_attr("t").is_none());
        assert!(node.child("list").is_none());
    }

    #[test]
    fn test_plain_delivery_receipt_has_no_type() {
        let node = build_receipt(&Jid::lid("5"), None, &ids(&["X"]), None).unwrap();
        assert_eq!(node.get_attr("to"), Some("5@lid"));
        assert!(node.get_attr("type").is_none());
    }

    #[test]
    fn test_aggregate_skips_own_and_groups() {
        let group = Jid::group("g1");
        let key = |id: &str, participant: Option<&str>, from_me: bool| MessageKey {
            remote_jid: group.clone(),
            from_me,
            id: id.to_string(),
            participant: participant.map(Jid::pn),
        };
        let keys = vec![
            key("1", Some("a"), false),
            key("2", Some("b"), false),
            key("3", Some("a"), false),
            key("4", Some("a"), true),
        ];

        let batches = aggregate_message_keys_not_from_me(&keys);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].message_ids, ids(&["1", "3"]));
        assert_eq!(batches[1].participant, Some(Jid::pn("b")));
    }
}
