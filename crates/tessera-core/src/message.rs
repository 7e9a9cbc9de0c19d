//! Message content model
//!
//! Content is a tagged variant per kind. Everything the relay needs to know
//! about a message (envelope type, media type, attached business metadata)
//! is derived here by exhaustive matching.

use serde::{Deserialize, Serialize};

use crate::types::Jid;

/// An outbound message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Content of the message
    pub content: MessageContent,
    /// Context carried alongside the content
    pub context_info: Option<MessageContextInfo>,
}

/// Extra context attached to a message
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContextInfo {
    /// Secret used by polls and reactions to derive per-message keys
    pub message_secret: Option<Vec<u8>>,
}

/// Reference to uploaded media
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Server path of the encrypted media
    pub direct_path: String,
    /// MIME type
    pub mimetype: String,
    /// Optional caption
    pub caption: Option<String>,
    /// Media encryption key
    pub media_key: Vec<u8>,
}

/// One button of a native flow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeFlowButton {
    /// Button name, decides the business node attached to the envelope
    pub name: String,
    /// JSON parameters
    pub params_json: String,
}

/// Content kinds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessageContent {
    /// Plain text
    Text {
        /// Body
        text: String,
    },
    /// Text with link preview or formatting
    ExtendedText {
        /// Body
        text: String,
        /// Matched link, if any
        matched_text: Option<String>,
    },
    /// Image
    Image(MediaInfo),
    /// Video, optionally played back as a gif
    Video {
        /// Media reference
        media: MediaInfo,
        /// Autoplay as gif
        gif_playback: bool,
    },
    /// Audio, optionally a push-to-talk voice note
    Audio {
        /// Media reference
        media: MediaInfo,
        /// Voice note
        ptt: bool,
    },
    /// Document
    Document(MediaInfo),
    /// Sticker
    Sticker(MediaInfo),
    /// Single contact card
    Contact {
        /// Name shown
        display_name: String,
        /// vCard body
        vcard: String,
    },
    /// Several contact cards
    ContactsArray {
        /// vCard bodies
        vcards: Vec<String>,
    },
    /// Live location share
    LiveLocation {
        /// Latitude in degrees
        latitude: f64,
        /// Longitude in degrees
        longitude: f64,
    },
    /// Reaction to another message
    Reaction {
        /// Id of the reacted message
        target_id: String,
        /// Emoji, empty to remove
        text: String,
    },
    /// Poll creation
    PollCreation {
        /// Question
        name: String,
        /// Options
        options: Vec<String>,
        /// How many options can be picked
        selectable_count: u32,
    },
    /// Poll vote
    PollUpdate {
        /// Id of the poll
        poll_id: String,
        /// Encrypted vote
        vote: Vec<u8>,
    },
    /// Legacy buttons message
    Buttons {
        /// Body
        text: String,
        /// Button labels
        buttons: Vec<String>,
    },
    /// List message
    List {
        /// Title
        title: String,
        /// Section titles
        sections: Vec<String>,
    },
    /// Reply to a list message
    ListResponse {
        /// Selected row
        selected_row_id: String,
    },
    /// Reply to a buttons message
    ButtonsResponse {
        /// Selected button
        selected_button_id: String,
    },
    /// Interactive message with an optional native flow
    Interactive {
        /// Body
        body: String,
        /// Native flow buttons, `None` for a plain interactive message
        native_flow: Option<Vec<NativeFlowButton>>,
    },
    /// Reply to an interactive message
    InteractiveResponse {
        /// Body
        body: String,
        /// Name of the native flow responded to
        native_flow_name: Option<String>,
    },
    /// Order
    Order {
        /// Order id
        order_id: String,
    },
    /// Product
    Product {
        /// Product id
        product_id: String,
    },
    /// Group invite
    GroupInvite {
        /// Group
        group: Jid,
        /// Invite code
        code: String,
    },
    /// Pin or unpin a message
    PinInChat {
        /// Target message
        target_id: String,
        /// Pin (true) or unpin
        pin: bool,
    },
    /// Keep or unkeep a disappearing message
    KeepInChat {
        /// Target message
        target_id: String,
        /// Keep (true) or unkeep
        keep: bool,
    },
    /// Group sender-key seed distributed to one device
    SenderKeyDistribution {
        /// Group the key belongs to
        group_id: Jid,
        /// Serialized distribution message
        distribution: Vec<u8>,
    },
    /// Copy of a sent message delivered to the sender's other devices
    DeviceSent {
        /// Original destination
        destination: Jid,
        /// Original message
        message: Box<Message>,
    },
    /// Protocol control message
    Protocol(ProtocolMessage),
    /// View-once wrapper
    ViewOnce(Box<Message>),
    /// Disappearing wrapper
    Ephemeral(Box<Message>),
    /// Document with caption wrapper
    DocumentWithCaption(Box<Message>),
}

/// Protocol control messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Delete for everyone
    Revoke {
        /// Target message
        target_id: String,
    },
    /// Edit a sent message
    Edit {
        /// Target message
        target_id: String,
        /// New content
        edited: Box<Message>,
    },
    /// Change disappearing-message timer
    EphemeralSetting {
        /// Timer in seconds, 0 disables
        expiration: u32,
    },
    /// Request to the primary device
    PeerDataOperationRequest(PeerDataOperationRequest),
}

/// Request sent to the account's own devices
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDataOperationRequest {
    /// Operation type
    pub request_type: PeerDataOperationType,
    /// Ids of the messages concerned
    pub message_ids: Vec<String>,
}

/// Peer data operation kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerDataOperationType {
    /// Ask the primary device to resend a message it can decrypt
    PlaceholderMessageResend,
    /// Ask for a history sync
    HistorySyncOnDemand,
}

/// Envelope `type` attribute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Text and anything without a more specific class
    Text,
    /// Media and rich content
    Media,
    /// Reaction
    Reaction,
    /// Poll creation or vote
    Poll,
}

impl MessageType {
    /// Wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Media => "media",
            MessageType::Reaction => "reaction",
            MessageType::Poll => "poll",
        }
    }
}

/// Business metadata class of a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ButtonType {
    /// List message
    List,
    /// Buttons message
    Buttons,
    /// Native flow "review_and_pay"
    ReviewAndPay,
    /// Native flow "review_order"
    ReviewOrder,
    /// Native flow "payment_info"
    PaymentInfo,
    /// Native flow "payment_status"
    PaymentStatus,
    /// Native flow "payment_method"
    PaymentMethod,
    /// Any other native flow
    Interactive,
}

impl ButtonType {
    /// Name used in the business node
    pub fn as_str(&self) -> &'static str {
        match self {
            ButtonType::List => "list",
            ButtonType::Buttons => "buttons",
            ButtonType::ReviewAndPay => "review_and_pay",
            ButtonType::ReviewOrder => "review_order",
            ButtonType::PaymentInfo => "payment_info",
            ButtonType::PaymentStatus => "payment_status",
            ButtonType::PaymentMethod => "payment_method",
            ButtonType::Interactive => "interactive",
        }
    }
}

impl Message {
    /// Message without context
    pub fn new(content: MessageContent) -> Self {
        Self {
            content,
            context_info: None,
        }
    }

    /// Plain text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageContent::Text { text: text.into() })
    }

    /// Strip view-once, ephemeral and caption wrappers
    pub fn normalized(&self) -> &Message {
        match &self.content {
            MessageContent::ViewOnce(inner)
            | MessageContent::Ephemeral(inner)
            | MessageContent::DocumentWithCaption(inner) => inner.normalized(),
            _ => self,
        }
    }

    /// Envelope type of this message
    pub fn message_type(&self) -> MessageType {
        let message = self.normalized();
        match &message.content {
            MessageContent::Reaction { .. } => MessageType::Reaction,
            MessageContent::PollCreation { .. } | MessageContent::PollUpdate { .. } => {
                MessageType::Poll
            }
            _ if message.media_type().is_some() => MessageType::Media,
            _ => MessageType::Text,
        }
    }

    /// Media type attribute for encrypted nodes
    pub fn media_type(&self) -> Option<&'static str> {
        match &self.normalized().content {
            MessageContent::Image(_) => Some("image"),
            MessageContent::Video { gif_playback, .. } => {
                Some(if *gif_playback { "gif" } else { "video" })
            }
            MessageContent::Audio { ptt, .. } => Some(if *ptt { "ptt" } else { "audio" }),
            MessageContent::Contact { .. } => Some("vcard"),
            MessageContent::Document(_) => Some("document"),
            MessageContent::ContactsArray { .. } => Some("contact_array"),
            MessageContent::LiveLocation { .. } => Some("livelocation"),
            MessageContent::Sticker(_) => Some("sticker"),
            MessageContent::List { .. } => Some("list"),
            MessageContent::ListResponse { .. } => Some("list_response"),
            MessageContent::ButtonsResponse { .. } => Some("buttons_response"),
            MessageContent::Order { .. } => Some("order"),
            MessageContent::Product { .. } => Some("product"),
            MessageContent::InteractiveResponse { .. } => Some("native_flow_response"),
            MessageContent::GroupInvite { .. } => Some("url"),
            MessageContent::ExtendedText { text, .. } if is_product_link(text) => {
                Some("productlink")
            }
            _ => None,
        }
    }

    /// Business metadata class, if any
    pub fn button_type(&self) -> Option<ButtonType> {
        match &self.normalized().content {
            MessageContent::List { .. } => Some(ButtonType::List),
            MessageContent::Buttons { .. } => Some(ButtonType::Buttons),
            MessageContent::Interactive {
                native_flow: Some(buttons),
                ..
            } => Some(match buttons.first().map(|b| b.name.as_str()) {
                Some("review_and_pay") => ButtonType::ReviewAndPay,
                Some("review_order") => ButtonType::ReviewOrder,
                Some("payment_info") => ButtonType::PaymentInfo,
                Some("payment_status") => ButtonType::PaymentStatus,
                Some("payment_method") => ButtonType::PaymentMethod,
                _ => ButtonType::Interactive,
            }),
            _ => None,
        }
    }

    /// Receivers should hide decryption failures for this message
    pub fn hides_decrypt_failure(&self) -> bool {
        matches!(
            &self.normalized().content,
            MessageContent::PinInChat { .. }
                | MessageContent::KeepInChat { .. }
                | MessageContent::Reaction { .. }
                | MessageContent::Protocol(ProtocolMessage::Edit { .. })
        )
    }

    /// Native flow name of an interactive response
    pub fn native_flow_response_name(&self) -> Option<&str> {
        match &self.normalized().content {
            MessageContent::InteractiveResponse {
                native_flow_name: Some(name),
                ..
            } => Some(name.as_str()),
            _ => None,
        }
    }
}

/// `https://wa.me/p/<digits>/<digits>` anywhere in the text
fn is_product_link(text: &str) -> bool {
    const PREFIX: &str = "https://wa.me/p/";
    text.match_indices(PREFIX).any(|(start, _)| {
        let rest = &text[start + PREFIX.len()..];
        let first = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if first == 0 || !rest[first..].starts_with('/') {
            return false;
        }
        rest[first + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type() {
        assert_eq!(Message::text("hi").message_type(), MessageType::Text);
        let reaction = Message::new(MessageContent::Reaction {
            target_id: "ABC".into(),
            text: "👍".into(),
        });
        assert_eq!(reaction.message_type(), MessageType::Reaction);
        let image = Message::new(MessageContent::Image(MediaInfo::default()));
        assert_eq!(image.message_type(), MessageType::Media);
    }

    #[test]
    fn test_wrappers_are_normalized() {
        let inner = Message::new(MessageContent::PollCreation {
            name: "lunch?".into(),
            options: vec!["yes".into(), "no".into()],
            selectable_count: 1,
        });
        let wrapped = Message::new(MessageContent::ViewOnce(Box::new(Message::new(
            MessageContent::Ephemeral(Box::new(inner)),
        ))));
        assert_eq!(wrapped.message_type(), MessageType::Poll);
    }

    #[test]
    fn test_media_types() {
        let gif = Message::new(MessageContent::Video {
            media: MediaInfo::default(),
            gif_playback: true,
        });
        assert_eq!(gif.media_type(), Some("gif"));
        let ptt = Message::new(MessageContent::Audio {
            media: MediaInfo::default(),
            ptt: true,
        });
        assert_eq!(ptt.media_type(), Some("ptt"));
        assert_eq!(Message::text("x").media_type(), None);
    }

    #[test]
    fn test_product_link() {
        let link = Message::new(MessageContent::ExtendedText {
            text: "see https://wa.me/p/123/456 now".into(),
            matched_text: None,
        });
        assert_eq!(link.media_type(), Some("productlink"));
        assert!(!is_product_link("https://wa.me/p/abc/1"));
        assert!(!is_product_link("https://wa.me/p/12/"));
    }

    #[test]
    fn test_button_type() {
        let pay = Message::new(MessageContent::Interactive {
            body: "pay".into(),
            native_flow: Some(vec![NativeFlowButton {
                name: "review_and_pay".into(),
                params_json: "{}".into(),
            }]),
        });
        assert_eq!(pay.button_type(), Some(ButtonType::ReviewAndPay));

        let plain = Message::new(MessageContent::Interactive {
            body: "hi".into(),
            native_flow: None,
        });
        assert_eq!(plain.button_type(), None);
    }

    #[test]
    fn test_hides_decrypt_failure() {
        let edit = Message::new(MessageContent::Protocol(ProtocolMessage::Edit {
            target_id: "X".into(),
            edited: Box::new(Message::text("fixed")),
        }));
        assert!(edit.hides_decrypt_failure());
        assert!(!Message::text("x").hides_decrypt_failure());
    }
}
