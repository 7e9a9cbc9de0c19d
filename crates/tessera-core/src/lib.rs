//! # Tessera Core
//!
//! Core types and storage contracts for the Tessera multi-device messaging client.
//!
//! This crate provides:
//! - Addressing types for phone-number and linked identities
//! - The outbound message content model
//! - An ordered, id-indexed collection
//! - A time-boxed LRU cache
//! - The key-value store contract for key material
//! - Common error types

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cache;
pub mod error;
pub mod keyed_db;
pub mod message;
pub mod storage;
pub mod types;

pub use cache::TtlCache;
pub use error::{Error, Result};
pub use keyed_db::{Keyed, KeyedDb, KeyedDbError, PageMode, SortOrder, UpdateOutcome};
pub use message::{Message, MessageContent};
pub use storage::{CategoryData, KeyCategory, KeyStore, KeyValue, Mutations};
pub use types::{DeviceTarget, Jid, LidPnPair, Server, SignalAddress};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::keyed_db::{Keyed, KeyedDb};
    pub use crate::message::{Message, MessageContent};
    pub use crate::storage::{KeyCategory, KeyStore, KeyValue, Mutations};
    pub use crate::types::{Jid, Server};
}
