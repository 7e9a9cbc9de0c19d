//! # Tessera Protocol
//!
//! Session assertion, transactional key storage and encrypted fan-out for a
//! multi-device messaging client.
//!
//! ## Overview
//!
//! - **Transactions**: [`TransactionalKeyStore`] batches key-store writes per
//!   lock key and commits them with bounded retry
//! - **Identity mapping**: [`LidMappingStore`] maps phone-number identities to
//!   linked identities and back
//! - **Retries**: [`MessageRetryManager`] remembers sent messages and throttles
//!   session recreation
//! - **Relay**: [`RelayEngine`] fans a message out to every recipient device
//!
//! Cryptography and transport are supplied by the caller through
//! [`SignalRepository`] and [`ServerClient`].
//!
//! ## Usage
//!
//! ```ignore
//! use tessera_protocol::prelude::*;
//!
//! let engine = RelayEngine::new(ClientConfig::default(), store, signal, server)?;
//! engine.set_account(account);
//!
//! let id = engine
//!     .relay_message(&recipient, &Message::text("hi"), RelayOptions::default())
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod devices;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod lid_mapping;
pub mod mutex;
pub mod network;
pub mod prekey;
pub mod receipt;
pub mod relay;
pub mod retry;
pub mod sessions;
pub mod signal;
pub mod transaction;

pub use config::ClientConfig;
pub use envelope::{Node, NodeContent};
pub use error::{ProtocolError, Result};
pub use lid_mapping::{LidMappingStore, LidResolver};
pub use network::{GroupMetadata, GroupMetadataCache, ServerClient};
pub use receipt::{MessageKey, ReceiptType};
pub use relay::{Account, RelayEngine, RelayOptions, RetryParticipant};
pub use retry::MessageRetryManager;
pub use signal::{CiphertextKind, SignalRepository};
pub use transaction::TransactionalKeyStore;

/// Version of the encrypted payload format
pub const ENC_VERSION: &str = "2";

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::ClientConfig;
    pub use crate::error::{ProtocolError, Result};
    pub use crate::relay::{Account, RelayEngine, RelayOptions};
    pub use crate::signal::SignalRepository;
    pub use crate::network::ServerClient;
    pub use crate::transaction::TransactionalKeyStore;
    pub use tessera_core::{Jid, Message};
}
