//! Deterministic simulated backend.
//!
//! Stands in for the opaque cryptography library so the coordination layer
//! can be exercised end to end. Each driver broadcasts one "fragment" to the
//! committee and completes once it holds a fragment from every member, so a
//! phase can only finish when the relay actually moved messages. All outputs
//! are deterministic hashes of the collected fragments: every party converges
//! on the same public key or signature without any party revealing its seed.

use crate::driver::{
    OutboundEnvelope, PhaseJob, PhaseOutcome, PhaseSpec, ProtocolBackend, RoundArtifact,
    RoundDriver,
};
use crate::{
    Committee, Error, KeyCurve, KeyShare, LibType, OperationKind, PartyId, Result,
    SignatureRecord, Vault,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

fn tag_hash(parts: &[&str]) -> String {
    hex::encode(blake3::hash(parts.join("|").as_bytes()).as_bytes())
}

/// What a backend handed to each created driver, kept for assertions
#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub job: PhaseJob,
    pub curve: KeyCurve,
    pub reshare_prefix: Option<String>,
    pub setup_message: Option<Vec<u8>>,
}

/// What a completed keygen-flavored phase produced, kept for assertions
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub curve: KeyCurve,
    pub reshare_prefix: Option<String>,
    pub public_key: String,
}

/// Simulated scheme backend
pub struct SimBackend {
    lib_type: LibType,
    /// Per-device entropy standing in for the library's key material
    device_seed: String,
    /// Drivers left to fail before the backend behaves again
    fail_next: AtomicU32,
    records: Mutex<Vec<PhaseRecord>>,
    outcomes: Arc<Mutex<Vec<OutcomeRecord>>>,
}

impl SimBackend {
    pub fn new(lib_type: LibType, device_seed: &str) -> Self {
        Self {
            lib_type,
            device_seed: device_seed.to_string(),
            fail_next: AtomicU32::new(0),
            records: Mutex::new(Vec::new()),
            outcomes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The next `count` driver creations fail, then recovery.
    pub fn fail_next_phases(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Specs observed by `create_driver`, in order.
    pub fn records(&self) -> Vec<PhaseRecord> {
        self.records.lock().expect("records lock").clone()
    }

    /// Keygen artifacts emitted by completed drivers, in order.
    pub fn outcomes(&self) -> Vec<OutcomeRecord> {
        self.outcomes.lock().expect("outcomes lock").clone()
    }

    fn consume_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ProtocolBackend for SimBackend {
    fn lib_type(&self) -> LibType {
        self.lib_type
    }

    fn create_setup_message(&self, spec: &PhaseSpec) -> Result<Vec<u8>> {
        if spec.committee.is_empty() {
            return Err(Error::SetupMessage("empty committee".into()));
        }
        let parties: Vec<&str> = spec.committee.iter().map(|p| p.as_str()).collect();
        Ok(tag_hash(&[&["setup"], &parties[..]].concat()).into_bytes())
    }

    fn create_driver(&self, spec: &PhaseSpec) -> Result<Arc<dyn RoundDriver>> {
        self.records.lock().expect("records lock").push(PhaseRecord {
            job: spec.job,
            curve: spec.curve,
            reshare_prefix: spec.reshare_prefix.clone(),
            setup_message: spec.setup_message.clone(),
        });
        if self.consume_failure() {
            return Err(Error::Driver("simulated library failure".into()));
        }
        SimDriver::new(self, spec).map(|d| Arc::new(d) as Arc<dyn RoundDriver>)
    }

    fn extract_local_secret(&self, _vault: &Vault, key_share: &KeyShare) -> Result<String> {
        if key_share.share.is_empty() {
            return Err(Error::MissingKeyShare(key_share.public_key.clone()));
        }
        // deliberately shorter than 32 bytes so callers must right-pad
        Ok(tag_hash(&["localui", &key_share.share])[..40].to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Fragment {
    party: PartyId,
    fragment: String,
}

#[derive(Default)]
struct DriverState {
    broadcast_sent: bool,
    fragments: BTreeMap<PartyId, String>,
}

/// One simulated phase: broadcast a fragment, gather the committee's
struct SimDriver {
    lib_type: LibType,
    job: PhaseJob,
    curve: KeyCurve,
    local_party: PartyId,
    committee: Committee,
    message_to_sign: Option<String>,
    reshare_prefix_in: Option<String>,
    local_fragment: String,
    outcomes: Arc<Mutex<Vec<OutcomeRecord>>>,
    state: Mutex<DriverState>,
}

impl SimDriver {
    fn new(backend: &SimBackend, spec: &PhaseSpec) -> Result<Self> {
        if !spec.committee.contains(&spec.local_party) {
            return Err(Error::InvalidConfig(
                "local party is not part of the committee".into(),
            ));
        }
        match spec.job {
            PhaseJob::Keysign => {
                if spec.message_to_sign.is_none() {
                    return Err(Error::Driver("keysign phase without a message".into()));
                }
                if spec.key_share.is_none() {
                    return Err(Error::MissingKeyShare("keysign local share".into()));
                }
            }
            PhaseJob::Keygen(op) => {
                if backend.lib_type == LibType::Dkls && spec.setup_message.is_none() {
                    return Err(Error::SetupMessage(
                        "keygen phase started without a setup message".into(),
                    ));
                }
                let reshare = matches!(op, OperationKind::Reshare);
                if reshare && spec.curve == KeyCurve::Eddsa && spec.reshare_prefix.is_none() {
                    return Err(Error::Driver(
                        "eddsa reshare requires the ecdsa reshare prefix".into(),
                    ));
                }
            }
        }

        let secret = spec
            .local_secret
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| backend.device_seed.clone());
        let local_fragment = tag_hash(&[
            "frag",
            &format!("{:?}", spec.curve),
            &format!("{:?}", spec.job),
            &spec.local_party,
            &secret,
            spec.message_to_sign.as_deref().unwrap_or("-"),
        ]);

        Ok(Self {
            lib_type: backend.lib_type,
            job: spec.job,
            curve: spec.curve,
            local_party: spec.local_party.clone(),
            committee: spec.committee.clone(),
            message_to_sign: spec.message_to_sign.clone(),
            reshare_prefix_in: spec.reshare_prefix.clone(),
            local_fragment,
            outcomes: Arc::clone(&backend.outcomes),
            state: Mutex::new(DriverState::default()),
        })
    }

    fn material(&self, fragments: &BTreeMap<PartyId, String>) -> String {
        fragments
            .values()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn finish_keygen(&self, fragments: &BTreeMap<PartyId, String>) -> Result<RoundArtifact> {
        let material = self.material(fragments);
        let curve_tag = format!("{:?}", self.curve);
        let public_key = tag_hash(&["pub", &curve_tag, &material]);
        let chain_code = tag_hash(&["chain", &material]);
        let share_doc = serde_json::json!({
            "party": self.local_party,
            "curve": curve_tag,
            "commitment": tag_hash(&["share", &self.local_party, &self.local_fragment, &material]),
        });
        let share = BASE64.encode(serde_json::to_vec(&share_doc)?);

        // the incoming prefix feeds the next version tag, so every committee
        // member must have received the same one
        let lineage = self.reshare_prefix_in.as_deref().unwrap_or("");
        let reshare_prefix = match self.job {
            PhaseJob::Keygen(OperationKind::Reshare)
            | PhaseJob::Keygen(OperationKind::Migrate) => {
                Some(tag_hash(&["prefix", &curve_tag, lineage, &material])[..16].to_string())
            }
            _ => None,
        };
        let setup_message = if self.lib_type == LibType::Dkls && self.curve == KeyCurve::Ecdsa {
            Some(tag_hash(&["setup-eddsa", &material]).into_bytes())
        } else {
            None
        };

        self.outcomes.lock().expect("outcomes lock").push(OutcomeRecord {
            curve: self.curve,
            reshare_prefix: reshare_prefix.clone(),
            public_key: public_key.clone(),
        });

        Ok(RoundArtifact::KeyShare(PhaseOutcome {
            key_share: KeyShare {
                public_key,
                share,
                chain_code,
            },
            reshare_prefix,
            setup_message,
        }))
    }

    fn finish_keysign(&self, fragments: &BTreeMap<PartyId, String>) -> Result<RoundArtifact> {
        let msg = self
            .message_to_sign
            .clone()
            .ok_or_else(|| Error::Driver("keysign phase without a message".into()))?;
        let material = self.material(fragments);
        let r = tag_hash(&["r", &msg, &material]);
        let s = tag_hash(&["s", &msg, &material]);
        let der = BASE64.encode([hex::decode(&r).unwrap_or_default(), hex::decode(&s).unwrap_or_default()].concat());
        Ok(RoundArtifact::Signature(SignatureRecord {
            msg,
            r,
            s,
            recovery_id: "00".into(),
            der_signature: der,
        }))
    }
}

impl RoundDriver for SimDriver {
    fn supply_inbound(&self, body: &[u8]) -> Result<()> {
        let fragment: Fragment = serde_json::from_slice(body)
            .map_err(|e| Error::Deserialization(format!("bad fragment: {e}")))?;
        let mut state = self.state.lock().expect("driver lock");
        // at-least-once delivery, duplicate fragments are a no-op
        state.fragments.entry(fragment.party).or_insert(fragment.fragment);
        Ok(())
    }

    fn drain_outbound(&self) -> Result<Vec<OutboundEnvelope>> {
        let mut state = self.state.lock().expect("driver lock");
        if state.broadcast_sent {
            return Ok(Vec::new());
        }
        state.broadcast_sent = true;
        state
            .fragments
            .insert(self.local_party.clone(), self.local_fragment.clone());

        let receivers: Vec<PartyId> = self
            .committee
            .iter()
            .filter(|p| *p != &self.local_party)
            .cloned()
            .collect();
        if receivers.is_empty() {
            // one-party import, nothing to send
            return Ok(Vec::new());
        }
        let body = serde_json::to_vec(&Fragment {
            party: self.local_party.clone(),
            fragment: self.local_fragment.clone(),
        })?;
        Ok(vec![OutboundEnvelope { receivers, body }])
    }

    fn try_finish(&self) -> Result<Option<RoundArtifact>> {
        let state = self.state.lock().expect("driver lock");
        if state.fragments.len() < self.committee.len() {
            return Ok(None);
        }
        let artifact = match self.job {
            PhaseJob::Keysign => self.finish_keysign(&state.fragments)?,
            PhaseJob::Keygen(_) => self.finish_keygen(&state.fragments)?,
        };
        Ok(Some(artifact))
    }
}
