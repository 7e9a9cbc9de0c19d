//! Envelope node model
//!
//! Outbound stanzas are trees of [`Node`]s: a tag, string attributes and
//! either raw bytes or child nodes. Binary framing of the tree belongs to the
//! transport.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tessera_core::message::ButtonType;

/// Attribute map of a node
pub type Attrs = BTreeMap<String, String>;

/// Content of a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeContent {
    /// Raw payload
    Bytes(Vec<u8>),
    /// Child nodes
    Nodes(Vec<Node>),
}

/// One element of an envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Element tag
    pub tag: String,
    /// Attributes
    pub attrs: Attrs,
    /// Payload or children
    pub content: Option<NodeContent>,
}

impl Node {
    /// Empty node
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: None,
        }
    }

    /// Set an attribute
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Merge attributes, overwriting existing keys
    pub fn attrs(mut self, attrs: &Attrs) -> Self {
        self.attrs
            .extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Set raw payload
    pub fn bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = Some(NodeContent::Bytes(bytes));
        self
    }

    /// Set children
    pub fn children(mut self, children: Vec<Node>) -> Self {
        self.content = Some(NodeContent::Nodes(children));
        self
    }

    /// Attribute value
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Children, empty for byte or empty content
    pub fn child_nodes(&self) -> &[Node] {
        match &self.content {
            Some(NodeContent::Nodes(nodes)) => nodes,
            _ => &[],
        }
    }

    /// First child with `tag`
    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.child_nodes().iter().find(|node| node.tag == tag)
    }

    /// Raw payload, if any
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.content {
            Some(NodeContent::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

/// Business metadata nodes attached to an envelope carrying `button_type`
pub fn business_nodes(button_type: ButtonType) -> Vec<Node> {
    let order_name = match button_type {
        ButtonType::ReviewAndPay => Some("order_details"),
        ButtonType::ReviewOrder => Some("order_status"),
        ButtonType::PaymentInfo => Some("payment_info"),
        ButtonType::PaymentStatus => Some("payment_status"),
        ButtonType::PaymentMethod => Some("payment_method"),
        _ => None,
    };
    if let Some(name) = order_name {
        return vec![Node::new("biz").attr("native_flow_name", name)];
    }

    let inner = match button_type {
        ButtonType::List => Node::new("list")
            .attr("type", "product_list")
            .attr("v", "2"),
        _ => Node::new("interactive")
            .attr("type", "native_flow")
            .attr("v", "1")
            .children(vec![Node::new("native_flow")
                .attr("name", "mixed")
                .attr("v", "9")]),
    };
    vec![Node::new("biz").children(vec![inner])]
}

/// Marker node for messages addressed to a business bot
pub fn bot_node() -> Node {
    Node::new("bot").attr("biz_bot", "1")
}

/// Caller-supplied nodes already carry business or bot metadata
pub fn has_business_node(nodes: &[Node]) -> bool {
    nodes.iter().any(|node| {
        if node.tag == "biz" || node.tag == "hsm" {
            return true;
        }
        if node.tag == "bot" && node.get_attr("biz_bot") == Some("1") {
            return true;
        }
        match node.child_nodes().first() {
            Some(first) => {
                matches!(first.tag.as_str(), "interactive" | "buttons" | "list")
                    || first
                        .child_nodes()
                        .first()
                        .is_some_and(|inner| inner.tag == "native_flow")
            }
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_accessors() {
        let node = Node::new("message")
            .attr("id", "ABC")
            .children(vec![Node::new("enc").attr("v", "2").bytes(vec![1, 2])]);

        assert_eq!(node.get_attr("id"), Some("ABC"));
        let enc = node.child("enc").unwrap();
        assert_eq!(enc.payload(), Some(&[1u8, 2][..]));
        assert!(enc.child_nodes().is_empty());
        assert!(node.child("participants").is_none());
    }

    #[test]
    fn test_attrs_merge_overwrites() {
        let extra = Attrs::from([("type".to_string(), "skmsg".to_string())]);
        let node = Node::new("enc").attr("type", "msg").attr("v", "2").attrs(&extra);
        assert_eq!(node.get_attr("type"), Some("skmsg"));
        assert_eq!(node.get_attr("v"), Some("2"));
    }

    #[test]
    fn test_business_nodes() {
        let list = business_nodes(ButtonType::List);
        assert_eq!(list[0].tag, "biz");
        assert_eq!(list[0].child("list").unwrap().get_attr("type"), Some("product_list"));

        let pay = business_nodes(ButtonType::ReviewAndPay);
        assert_eq!(pay[0].get_attr("native_flow_name"), Some("order_details"));

        let flow = business_nodes(ButtonType::Buttons);
        let interactive = flow[0].child("interactive").unwrap();
        assert_eq!(interactive.child("native_flow").unwrap().get_attr("name"), Some("mixed"));
    }

    #[test]
    fn test_has_business_node() {
        assert!(has_business_node(&business_nodes(ButtonType::List)));
        assert!(has_business_node(&business_nodes(ButtonType::Interactive)));
        assert!(has_business_node(&[bot_node()]));
        assert!(!has_business_node(&[Node::new("meta").attr("appdata", "default")]));
        assert!(!has_business_node(&[Node::new("bot")]));
        assert!(!has_business_node(&[]));
    }
}
