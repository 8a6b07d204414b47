//! Threshold-signature session coordination.
//!
//! Drives multi-device key generation, resharing, migration, key import and
//! signing over an untrusted HTTP message relay. The cryptographic rounds
//! themselves live behind [`driver::ProtocolBackend`]; this crate owns
//! everything around them: session lifecycle, participant discovery,
//! encrypted message transport, bounded retries, the all-parties completion
//! barrier and vault materialization.

pub mod backend;
pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod deeplink;
pub mod discovery;
pub mod driver;
pub mod encryption;
pub mod error;
pub mod materializer;
pub mod puller;
pub mod runner;
pub mod transport;
pub mod types;

pub use config::ProtocolConfig;
pub use coordinator::{KeygenRequest, SessionCoordinator, TransportFactory};
pub use deeplink::{DeepLinkPayload, KeygenInvite, KeysignInvite, ReshareInvite};
pub use encryption::{CipherSuite, EncryptionKey, SessionCipher};
pub use error::{Error, Result, Severity};
pub use materializer::{VaultMaterializer, VaultStore};
pub use runner::{
    KeygenOutcome, KeygenParams, KeysignParams, KeysignReport, OperationStatus, ProtocolRunner,
};
pub use types::{
    message_hash, right_pad_hex, Committee, KeyCurve, KeyShare, LibType, OperationKind, PartyId,
    RelayMessage, Session, SessionId, SignatureRecord, Vault,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
