//! Error types for session coordination

use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, Error>;

/// How an error should be handled by the caller.
///
/// Transient errors are retried locally and stay invisible unless the retry
/// bound is exhausted. Protocol-fatal errors move the state machine to
/// `Failed` and must never leave a partially persisted vault. Configuration
/// errors are detected before any network round starts where possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Transient,
    ProtocolFatal,
    ConfigFatal,
}

/// Errors that can occur while coordinating a keygen/reshare/keysign session
#[derive(Debug, Error)]
pub enum Error {
    /// Network/relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Timeout waiting for a peer or message
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Transport encryption/decryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The round driver rejected a message or failed a round
    #[error("Round driver error: {0}")]
    Driver(String),

    /// Setup message could not be created, uploaded or downloaded
    #[error("Setup message error: {0}")]
    SetupMessage(String),

    /// A protocol phase failed on every allowed attempt
    #[error("{operation} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        operation: String,
        attempts: u8,
        reason: String,
    },

    /// The completion barrier timed out with parties still missing
    #[error("partial result, parties never completed: {0:?}")]
    IncompleteCommittee(Vec<String>),

    /// A required key share is absent (e.g. migration precondition)
    #[error("missing key share for {0}")]
    MissingKeyShare(String),

    /// The selected vault does not match the session being joined
    #[error("vault mismatch: {0}")]
    VaultMismatch(String),

    /// A vault with this name already exists
    #[error("vault name already in use: {0}")]
    DuplicateVaultName(String),

    /// Operation/scheme combination the backend does not support
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Invalid session or runner configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed deep-link / QR payload
    #[error("invalid deep link: {0}")]
    DeepLink(String),

    /// Filesystem error while persisting or loading a vault
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify the error for retry handling.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Relay(_)
            | Error::Timeout(_)
            | Error::Encryption(_)
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Driver(_)
            | Error::SetupMessage(_) => Severity::Transient,

            Error::RetriesExhausted { .. }
            | Error::IncompleteCommittee(_)
            | Error::MissingKeyShare(_)
            | Error::VaultMismatch(_)
            | Error::Io(_)
            | Error::Internal(_) => Severity::ProtocolFatal,

            Error::DuplicateVaultName(_)
            | Error::UnsupportedOperation(_)
            | Error::InvalidConfig(_)
            | Error::DeepLink(_) => Severity::ConfigFatal,
        }
    }

    /// True when a bounded retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        self.severity() == Severity::Transient
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
