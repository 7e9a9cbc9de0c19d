//! Protocol error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] tessera_core::Error),

    /// Receipt sent without message ids
    #[error("missing ids in receipt")]
    MissingReceiptIds,

    /// Operation needs a logged-in account
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Content patch produced per-recipient variants for a group send
    #[error("Per-jid patching is not supported in groups")]
    PerJidPatchInGroup,

    /// Target address cannot receive this send
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Encryption primitive failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Session could not be established
    #[error("Session error: {0}")]
    Session(String),

    /// Network query or transmission failed
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Caller broke the API contract; retrying the same call cannot succeed
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::MissingReceiptIds
                | ProtocolError::NotAuthenticated
                | ProtocolError::PerJidPatchInGroup
                | ProtocolError::InvalidTarget(_)
                | ProtocolError::Config(_)
        )
    }
}
