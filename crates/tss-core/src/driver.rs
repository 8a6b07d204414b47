//! Seams isolating the opaque cryptography library.
//!
//! The coordination logic never touches cryptographic math. A
//! [`ProtocolBackend`] (one per scheme) turns a [`PhaseSpec`] into a
//! [`RoundDriver`]; the runner and puller pump opaque bytes through the
//! driver until it reports an artifact.

use crate::{
    Committee, KeyCurve, KeyShare, OperationKind, PartyId, Result, SignatureRecord, Vault,
};
use std::sync::Arc;
use zeroize::Zeroizing;

/// What a phase is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseJob {
    /// Key material (keygen, reshare, migrate, import)
    Keygen(OperationKind),
    /// A signature for one message
    Keysign,
}

/// Everything a backend needs to instantiate one protocol phase
pub struct PhaseSpec {
    pub job: PhaseJob,
    pub curve: KeyCurve,
    pub local_party: PartyId,
    pub committee: Committee,
    /// Previous committee, only populated for reshare/migrate
    pub old_committee: Committee,
    /// Setup message consumed by this phase (downloaded, or produced by the
    /// preceding curve's phase)
    pub setup_message: Option<Vec<u8>>,
    /// Reshare version tag threaded from the preceding reshare phase
    pub reshare_prefix: Option<String>,
    /// Padded-hex local secret seeding the share (key import / migration)
    pub local_secret: Option<Zeroizing<String>>,
    /// Hex message to sign (keysign only)
    pub message_to_sign: Option<String>,
    /// Derivation path for the signing key (keysign only)
    pub chain_path: Option<String>,
    /// Local key share blob backing a keysign phase
    pub key_share: Option<KeyShare>,
}

impl PhaseSpec {
    /// Minimal keygen-flavored spec; optional fields default to `None`.
    pub fn keygen(
        operation: OperationKind,
        curve: KeyCurve,
        local_party: PartyId,
        committee: Committee,
    ) -> Self {
        Self {
            job: PhaseJob::Keygen(operation),
            curve,
            local_party,
            committee,
            old_committee: Committee::new(),
            setup_message: None,
            reshare_prefix: None,
            local_secret: None,
            message_to_sign: None,
            chain_path: None,
            key_share: None,
        }
    }

}

/// Outbound protocol message produced by a driver, pre-encryption
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub receivers: Vec<PartyId>,
    pub body: Vec<u8>,
}

/// Result of a completed keygen-flavored phase
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub key_share: KeyShare,
    /// Version tag the next reshare phase must receive unchanged
    pub reshare_prefix: Option<String>,
    /// Setup message the next curve's phase consumes
    pub setup_message: Option<Vec<u8>>,
}

/// Artifact a driver yields when its rounds are done
#[derive(Debug, Clone)]
pub enum RoundArtifact {
    KeyShare(PhaseOutcome),
    Signature(SignatureRecord),
}

/// One in-flight protocol phase owned by the cryptography library.
///
/// Implementations must be internally synchronized: the puller supplies
/// inbound messages while the runner drains outbound ones from another task.
/// `supply_inbound` must tolerate duplicated messages (relay delivery is
/// at-least-once).
pub trait RoundDriver: Send + Sync {
    /// Feed one decrypted peer message into the round state machine.
    fn supply_inbound(&self, body: &[u8]) -> Result<()>;

    /// Messages the library wants delivered to peers. Drained repeatedly
    /// until the phase completes.
    fn drain_outbound(&self) -> Result<Vec<OutboundEnvelope>>;

    /// `Some` once the phase finished, `Err` when it failed irrecoverably
    /// within this attempt.
    fn try_finish(&self) -> Result<Option<RoundArtifact>>;
}

/// Strategy object wrapping one cryptographic scheme.
///
/// Selected once per operation by the vault's `LibType`; call sites dispatch
/// through the trait instead of branching on the scheme.
pub trait ProtocolBackend: Send + Sync {
    fn lib_type(&self) -> crate::LibType;

    /// Build the setup message the initiating device uploads to the relay
    /// before the first phase.
    fn create_setup_message(&self, spec: &PhaseSpec) -> Result<Vec<u8>>;

    /// Instantiate the library-side state machine for one phase.
    fn create_driver(&self, spec: &PhaseSpec) -> Result<Arc<dyn RoundDriver>>;

    /// Extract the local secret from a legacy key share (migration
    /// precondition). The returned hex is not yet padded.
    fn extract_local_secret(&self, vault: &Vault, key_share: &KeyShare) -> Result<String>;
}
