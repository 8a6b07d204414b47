//! Deep-link session invitations.
//!
//! The initiating device renders one of these as a QR code; joiners scan it
//! and obtain everything needed to dial the relay and decrypt traffic.
//! Encoding and parsing round-trip byte for byte so a re-rendered invitation
//! stays scannable by older releases.

use crate::encryption::{CipherSuite, EncryptionKey};
use crate::{Error, KeyCurve, LibType, OperationKind, PartyId, Result, SessionId};
use serde::{Deserialize, Serialize};
use url::Url;

const SCHEME: &str = "tss";
const HOST: &str = "vault";

/// Invitation to join a fresh keygen (or key import) session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenInvite {
    pub session_id: SessionId,
    pub service_name: String,
    pub encryption_key: EncryptionKey,
    pub cipher: CipherSuite,
    /// False while the session lives on the local-network mediator
    pub use_public_relay: bool,
    pub vault_name: String,
    pub lib_type: LibType,
}

/// Invitation to join a reshare or migration session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshareInvite {
    pub session_id: SessionId,
    pub service_name: String,
    pub encryption_key: EncryptionKey,
    pub cipher: CipherSuite,
    pub use_public_relay: bool,
    pub vault_name: String,
    /// Identifies the vault being reshared so a joiner can refuse a mismatch
    pub public_key_ecdsa: String,
    pub hex_chain_code: String,
    pub old_committee: Vec<PartyId>,
    pub old_reshare_prefix: String,
}

/// Invitation to join a keysign session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignInvite {
    pub session_id: SessionId,
    pub service_name: String,
    pub encryption_key: EncryptionKey,
    pub cipher: CipherSuite,
    pub use_public_relay: bool,
    pub public_key_ecdsa: String,
    pub curve: KeyCurve,
    /// Hex messages to sign, in signing order
    pub messages: Vec<String>,
}

/// Payload carried by a session deep link / QR code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepLinkPayload {
    Keygen(OperationKind, KeygenInvite),
    Reshare(OperationKind, ReshareInvite),
    Keysign(KeysignInvite),
}

impl DeepLinkPayload {
    /// Render as a `tss://` URL.
    pub fn encode(&self) -> Result<String> {
        let (flow, tss_type, json) = match self {
            DeepLinkPayload::Keygen(op, invite) => {
                ("NewVault", op.as_str(), serde_json::to_string(invite)?)
            }
            DeepLinkPayload::Reshare(op, invite) => {
                ("NewVault", op.as_str(), serde_json::to_string(invite)?)
            }
            DeepLinkPayload::Keysign(invite) => {
                ("SignTransaction", "Keysign", serde_json::to_string(invite)?)
            }
        };
        let mut url = Url::parse(&format!("{SCHEME}://{HOST}"))
            .map_err(|e| Error::DeepLink(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("type", flow)
            .append_pair("tssType", tss_type)
            .append_pair("jsonData", &json);
        Ok(url.to_string())
    }

    /// Parse a scanned `tss://` URL.
    pub fn parse(link: &str) -> Result<Self> {
        let url = Url::parse(link).map_err(|e| Error::DeepLink(e.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(Error::DeepLink(format!(
                "unexpected scheme: {}",
                url.scheme()
            )));
        }
        let query = |name: &str| -> Result<String> {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .ok_or_else(|| Error::DeepLink(format!("missing query parameter: {name}")))
        };
        let flow = query("type")?;
        let tss_type = query("tssType")?;
        let json = query("jsonData")?;

        match flow.as_str() {
            "NewVault" => {
                let op: OperationKind = tss_type.parse()?;
                match op {
                    OperationKind::Keygen | OperationKind::KeyImport => {
                        let invite: KeygenInvite = serde_json::from_str(&json)
                            .map_err(|e| Error::DeepLink(format!("keygen payload: {e}")))?;
                        Ok(DeepLinkPayload::Keygen(op, invite))
                    }
                    OperationKind::Reshare | OperationKind::Migrate => {
                        let invite: ReshareInvite = serde_json::from_str(&json)
                            .map_err(|e| Error::DeepLink(format!("reshare payload: {e}")))?;
                        Ok(DeepLinkPayload::Reshare(op, invite))
                    }
                }
            }
            "SignTransaction" => {
                let invite: KeysignInvite = serde_json::from_str(&json)
                    .map_err(|e| Error::DeepLink(format!("keysign payload: {e}")))?;
                Ok(DeepLinkPayload::Keysign(invite))
            }
            other => Err(Error::DeepLink(format!("unknown link type: {other}"))),
        }
    }
}
