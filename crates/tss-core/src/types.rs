//! Core types shared across the coordination protocol

use crate::encryption::{CipherSuite, EncryptionKey};
use serde::{Deserialize, Serialize};

/// Opaque identifier for a device within a vault, derived from device
/// identity.
pub type PartyId = String;

/// Logical coordination channel identifier (UUID v4 text)
pub type SessionId = String;

/// Cryptographic scheme backing a vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LibType {
    /// Legacy multi-round threshold scheme
    Gg20,
    /// Two-curve scheme producing ECDSA and EdDSA keys
    Dkls,
}

/// Curve a protocol phase operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyCurve {
    Ecdsa,
    Eddsa,
}

/// Logical operation a session performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Keygen,
    Reshare,
    /// Reshare variant converting a legacy vault into the newer scheme
    Migrate,
    /// Degenerate keygen seeded from an externally supplied private key
    KeyImport,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Keygen => "Keygen",
            OperationKind::Reshare => "Reshare",
            OperationKind::Migrate => "Migrate",
            OperationKind::KeyImport => "KeyImport",
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "Keygen" => Ok(OperationKind::Keygen),
            "Reshare" => Ok(OperationKind::Reshare),
            "Migrate" => Ok(OperationKind::Migrate),
            "KeyImport" => Ok(OperationKind::KeyImport),
            other => Err(crate::Error::DeepLink(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// Ordered, duplicate-free set of parties expected to participate.
///
/// Built incrementally during discovery, frozen at session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Committee {
    parties: Vec<PartyId>,
}

impl Committee {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insertion order is preserved, duplicates dropped.
    pub fn from_parties<I, S>(parties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PartyId>,
    {
        let mut committee = Self::new();
        for party in parties {
            committee.insert(party.into());
        }
        committee
    }

    /// Returns true when the party was not yet a member.
    pub fn insert(&mut self, party: PartyId) -> bool {
        if self.parties.contains(&party) {
            return false;
        }
        self.parties.push(party);
        true
    }

    pub fn contains(&self, party: &str) -> bool {
        self.parties.iter().any(|p| p == party)
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartyId> {
        self.parties.iter()
    }

    pub fn as_slice(&self) -> &[PartyId] {
        &self.parties
    }

    /// Members not present in `done` (the barrier is satisfied when empty).
    pub fn missing_from(&self, done: &[PartyId]) -> Vec<PartyId> {
        self.parties
            .iter()
            .filter(|p| !done.contains(p))
            .cloned()
            .collect()
    }
}

impl From<Vec<PartyId>> for Committee {
    fn from(parties: Vec<PartyId>) -> Self {
        Self::from_parties(parties)
    }
}

/// One logical coordination channel, created once per operation.
///
/// Immutable after creation except for the relay address, which may switch
/// between the local mediator and the public relay before the session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub service_name: String,
    pub relay_address: String,
    pub encryption_key: EncryptionKey,
    pub cipher: CipherSuite,
}

impl Session {
    /// Create a fresh session with a random id, service name and pre-shared
    /// encryption key.
    pub fn create(service_prefix: &str, relay_address: &str, cipher: CipherSuite) -> Self {
        use rand::Rng;
        let suffix: u16 = rand::thread_rng().gen_range(1..=1000);
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            service_name: format!("{service_prefix}-{suffix}"),
            relay_address: relay_address.trim_end_matches('/').to_string(),
            encryption_key: EncryptionKey::generate(),
            cipher,
        }
    }
}

/// One party's opaque fragment of a threshold key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    /// Public key of the full threshold key (hex)
    pub public_key: String,
    /// Opaque share blob (base64)
    pub share: String,
    /// Chain code for hierarchical derivation (hex)
    pub chain_code: String,
}

/// Aggregate created only after the completion barrier confirms all-party
/// success. Never persisted partially.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub name: String,
    pub local_party_id: PartyId,
    pub signers: Committee,
    pub pub_key_ecdsa: String,
    pub pub_key_eddsa: String,
    pub hex_chain_code: String,
    pub lib_type: LibType,
    pub key_shares: Vec<KeyShare>,
}

impl Vault {
    pub fn key_share(&self, public_key: &str) -> Option<&KeyShare> {
        self.key_shares.iter().find(|ks| ks.public_key == public_key)
    }

    /// Public key for the requested curve.
    pub fn public_key(&self, curve: KeyCurve) -> &str {
        match curve {
            KeyCurve::Ecdsa => &self.pub_key_ecdsa,
            KeyCurve::Eddsa => &self.pub_key_eddsa,
        }
    }
}

/// Encrypted protocol message routed through the relay.
///
/// Delivery is at-least-once; receivers de-dupe by `hash` and delete after
/// applying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub session_id: SessionId,
    pub from: PartyId,
    pub to: Vec<PartyId>,
    /// Base64 ciphertext
    pub body: String,
    /// Hash of the plaintext body, used for de-duplication and deletion
    pub hash: String,
    /// Sender-local ordering hint
    pub sequence_no: i64,
}

/// Signature produced by a keysign session, keyed by message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Hex of the signed message
    pub msg: String,
    pub r: String,
    pub s: String,
    pub recovery_id: String,
    /// DER encoding when the curve provides one (base64)
    pub der_signature: String,
}

/// Hash used for message ids and relay de-duplication keys.
pub fn message_hash(body: &str) -> String {
    hex::encode(blake3::hash(body.as_bytes()).as_bytes())
}

/// Right-pad a little-endian hex secret to 64 characters.
///
/// Legacy local shares are sometimes shorter than 32 bytes; the newer scheme
/// expects the number little-endian, so zeros go at the end. Non-hex input is
/// returned unchanged.
pub fn right_pad_hex(hex_str: &str) -> String {
    if !hex_str.chars().all(|c| c.is_ascii_hexdigit()) {
        return hex_str.to_string();
    }
    const PADDED_LEN: usize = 64;
    if hex_str.len() < PADDED_LEN {
        let mut padded = hex_str.to_string();
        padded.extend(std::iter::repeat('0').take(PADDED_LEN - hex_str.len()));
        return padded;
    }
    hex_str.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committee_preserves_order_and_dedupes() {
        let mut committee = Committee::from_parties(["b", "a", "b", "c"]);
        assert_eq!(committee.as_slice(), &["b", "a", "c"]);
        assert!(!committee.insert("a".into()));
        assert!(committee.insert("d".into()));
        assert_eq!(committee.len(), 4);
    }

    #[test]
    fn committee_missing_from() {
        let committee = Committee::from_parties(["a", "b", "c"]);
        let done = vec!["a".to_string(), "c".to_string()];
        assert_eq!(committee.missing_from(&done), vec!["b".to_string()]);
        let all = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(committee.missing_from(&all).is_empty());
    }

    #[test]
    fn right_pad_hex_pads_to_64() {
        let padded = right_pad_hex("abcd");
        assert_eq!(padded.len(), 64);
        assert!(padded.starts_with("abcd"));
        assert!(padded.ends_with('0'));

        let full = "ff".repeat(32);
        assert_eq!(right_pad_hex(&full), full);

        // non-hex input passes through untouched
        assert_eq!(right_pad_hex("not-hex"), "not-hex");
    }

    #[test]
    fn message_hash_is_stable() {
        assert_eq!(message_hash("abc"), message_hash("abc"));
        assert_ne!(message_hash("abc"), message_hash("abd"));
    }

    #[test]
    fn session_create_uses_prefix_and_trims_relay() {
        let session = Session::create("Vault", "http://127.0.0.1:18080/", CipherSuite::AesGcm);
        assert!(session.service_name.starts_with("Vault-"));
        assert_eq!(session.relay_address, "http://127.0.0.1:18080");
        assert!(!session.session_id.is_empty());
    }
}
