//! Relay transport seam.
//!
//! Everything the coordination protocol needs from the relay server is
//! expressed through [`RelayTransport`]; the HTTP client lives in a separate
//! crate and an in-memory implementation backs the tests.

use crate::{PartyId, RelayMessage, Result, SignatureRecord};

pub use ::async_trait::async_trait;

/// HTTP-shaped relay surface used by every coordination component
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Register the local party's presence in a session. Append-only.
    async fn register_party(&self, session_id: &str, party_id: &str) -> Result<()>;

    /// All parties that registered interest so far. Empty while the relay
    /// has no record of the session.
    async fn participants(&self, session_id: &str) -> Result<Vec<PartyId>>;

    /// Drop every record the relay holds for the session.
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Freeze the committee and signal "go". One-way: a started session
    /// never un-starts.
    async fn start_session(&self, session_id: &str, committee: &[PartyId]) -> Result<()>;

    /// The frozen committee, or `None` while the session has not started.
    async fn started_committee(&self, session_id: &str) -> Result<Option<Vec<PartyId>>>;

    /// Record that the local party finished its rounds. One-way.
    async fn mark_complete(&self, session_id: &str, party_id: &str) -> Result<()>;

    /// Parties that reported completion so far.
    async fn completed_parties(&self, session_id: &str) -> Result<Vec<PartyId>>;

    /// Store an encrypted protocol message for each of its recipients.
    /// `message_id` scopes keysign traffic to one in-flight message.
    async fn post_message(&self, message_id: Option<&str>, message: &RelayMessage) -> Result<()>;

    /// Inbound messages addressed to `party_id`, possibly duplicated.
    async fn fetch_messages(
        &self,
        session_id: &str,
        party_id: &str,
        message_id: Option<&str>,
    ) -> Result<Vec<RelayMessage>>;

    /// Remove an applied message so it is not delivered again.
    async fn delete_message(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> Result<()>;

    /// Publish the encrypted setup message for joiners to download.
    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        body: &str,
    ) -> Result<()>;

    /// Encrypted setup message, or `None` while the initiator has not
    /// uploaded it yet.
    async fn download_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> Result<Option<String>>;

    /// Publish the signature for one keysign message so slower peers can
    /// adopt it instead of re-signing.
    async fn mark_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &SignatureRecord,
    ) -> Result<()>;

    /// Signature a peer already produced for this message, if any.
    async fn check_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<SignatureRecord>>;
}

/// In-memory transport for testing
pub mod memory;

pub use memory::MemoryTransport;
