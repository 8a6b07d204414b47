//! Protocol runner.
//!
//! Drives the two-curve keygen/reshare/migrate/import flow and per-message
//! keysign through a [`ProtocolBackend`], pumping each phase's driver against
//! the relay with bounded retries. Progress is published over a watch channel
//! so UIs can render the current phase without polling the runner.

use crate::config::ProtocolConfig;
use crate::driver::{PhaseJob, PhaseSpec, ProtocolBackend, RoundArtifact, RoundDriver};
use crate::encryption::SessionCipher;
use crate::puller::{MessagePuller, MessageSender};
use crate::transport::RelayTransport;
use crate::{
    message_hash, right_pad_hex, Committee, Error, KeyCurve, KeyShare, LibType, OperationKind,
    PartyId, Result, SessionId, SignatureRecord, Vault,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Externally observable progress of a running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Idle,
    CreatingInstance,
    KeygenEcdsa,
    ReshareEcdsa,
    KeygenEddsa,
    ReshareEddsa,
    KeysignEcdsa,
    KeysignEddsa,
    Finished,
    Failed(String),
}

/// Inputs for a keygen-flavored operation
pub struct KeygenParams {
    pub operation: OperationKind,
    pub committee: Committee,
    /// Populated for reshare/migrate; the devices holding the old shares
    pub old_committee: Committee,
    /// The initiating device creates and uploads the setup message
    pub initiator: bool,
    /// Source vault for reshare/migrate
    pub vault: Option<Vault>,
    /// Externally supplied private key (hex) for key import
    pub imported_secret: Option<Zeroizing<String>>,
    /// Version tag from the vault's previous reshare, fed into the first
    /// phase of the next one
    pub reshare_prefix: Option<String>,
}

/// Key material produced by a successful keygen-flavored operation
#[derive(Debug, Clone)]
pub struct KeygenOutcome {
    pub ecdsa: KeyShare,
    pub eddsa: KeyShare,
    pub lib_type: LibType,
}

/// Inputs for a keysign operation
pub struct KeysignParams {
    pub curve: KeyCurve,
    /// Hex-encoded messages, signed sequentially
    pub messages: Vec<String>,
    pub chain_path: Option<String>,
    pub key_share: KeyShare,
    pub committee: Committee,
}

/// Per-message result of a keysign operation. Signatures already produced
/// survive a later message's failure.
#[derive(Debug, Clone, Default)]
pub struct KeysignReport {
    /// Keyed by the hex message that was signed
    pub signatures: BTreeMap<String, SignatureRecord>,
    pub failures: Vec<KeysignFailure>,
}

#[derive(Debug, Clone)]
pub struct KeysignFailure {
    pub msg: String,
    pub reason: String,
}

pub struct ProtocolRunner {
    transport: Arc<dyn RelayTransport>,
    backend: Arc<dyn ProtocolBackend>,
    cipher: Arc<SessionCipher>,
    session_id: SessionId,
    local_party: PartyId,
    config: ProtocolConfig,
    status_tx: watch::Sender<OperationStatus>,
}

impl ProtocolRunner {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        backend: Arc<dyn ProtocolBackend>,
        cipher: Arc<SessionCipher>,
        session_id: SessionId,
        local_party: PartyId,
        config: ProtocolConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(OperationStatus::Idle);
        Self {
            transport,
            backend,
            cipher,
            session_id,
            local_party,
            config,
            status_tx,
        }
    }

    /// Live view of operation progress.
    pub fn subscribe_status(&self) -> watch::Receiver<OperationStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> OperationStatus {
        self.status_tx.borrow().clone()
    }

    fn set_status(&self, status: OperationStatus) {
        debug!(session_id = %self.session_id, ?status, "status");
        self.status_tx.send_replace(status);
    }

    pub fn mark_finished(&self) {
        self.set_status(OperationStatus::Finished);
    }

    pub fn mark_failed(&self, reason: &str) {
        self.set_status(OperationStatus::Failed(reason.to_string()));
    }

    /// Run both curve phases of a keygen-flavored operation.
    pub async fn run_keygen(&self, params: &KeygenParams) -> Result<KeygenOutcome> {
        self.validate_keygen(params)?;
        self.set_status(OperationStatus::CreatingInstance);

        let secrets = self.keygen_secrets(params)?;
        let reshare = matches!(
            params.operation,
            OperationKind::Reshare | OperationKind::Migrate
        );

        // ECDSA phase; its outcome carries the EdDSA setup and, for reshare,
        // the version prefix both phases must agree on
        let mut ecdsa_spec = self.keygen_spec(params, KeyCurve::Ecdsa, secrets.0);
        ecdsa_spec.setup_message = Some(self.obtain_setup_message(params, &ecdsa_spec).await?);
        self.set_status(if reshare {
            OperationStatus::ReshareEcdsa
        } else {
            OperationStatus::KeygenEcdsa
        });
        let ecdsa = self
            .run_phase_with_retry(&ecdsa_spec, "keygen-ecdsa")
            .await?;
        let ecdsa_outcome = match ecdsa {
            RoundArtifact::KeyShare(outcome) => outcome,
            RoundArtifact::Signature(_) => {
                return Err(Error::Internal("keygen phase yielded a signature".into()))
            }
        };

        tokio::time::sleep(self.config.inter_phase_delay).await;

        let mut eddsa_spec = self.keygen_spec(params, KeyCurve::Eddsa, secrets.1);
        eddsa_spec.setup_message = ecdsa_outcome.setup_message.clone();
        eddsa_spec.reshare_prefix = ecdsa_outcome.reshare_prefix.clone();
        self.set_status(if reshare {
            OperationStatus::ReshareEddsa
        } else {
            OperationStatus::KeygenEddsa
        });
        let eddsa = self
            .run_phase_with_retry(&eddsa_spec, "keygen-eddsa")
            .await?;
        let eddsa_outcome = match eddsa {
            RoundArtifact::KeyShare(outcome) => outcome,
            RoundArtifact::Signature(_) => {
                return Err(Error::Internal("keygen phase yielded a signature".into()))
            }
        };

        info!(
            session_id = %self.session_id,
            operation = params.operation.as_str(),
            "key generation complete"
        );
        Ok(KeygenOutcome {
            ecdsa: ecdsa_outcome.key_share,
            eddsa: eddsa_outcome.key_share,
            lib_type: self.backend.lib_type(),
        })
    }

    /// Sign each message in order. A message's failure is recorded and does
    /// not discard signatures already produced.
    pub async fn run_keysign(&self, params: &KeysignParams) -> Result<KeysignReport> {
        if params.messages.is_empty() {
            return Err(Error::InvalidConfig("no messages to sign".into()));
        }
        if !params.committee.contains(&self.local_party) {
            return Err(Error::InvalidConfig(
                "local party is not part of the signing committee".into(),
            ));
        }
        self.set_status(match params.curve {
            KeyCurve::Ecdsa => OperationStatus::KeysignEcdsa,
            KeyCurve::Eddsa => OperationStatus::KeysignEddsa,
        });

        let mut report = KeysignReport::default();
        for (index, msg) in params.messages.iter().enumerate() {
            if index > 0 {
                // give slower peers room to finish the previous message
                tokio::time::sleep(self.config.inter_phase_delay).await;
            }
            let message_id = message_hash(msg);
            match self.sign_one(params, msg, &message_id).await {
                Ok(signature) => {
                    if let Err(err) = self
                        .transport
                        .mark_keysign_complete(&self.session_id, &message_id, &signature)
                        .await
                    {
                        warn!(%message_id, %err, "failed to publish signature");
                    }
                    report.signatures.insert(msg.clone(), signature);
                }
                Err(err) => {
                    warn!(%message_id, %err, "message signing failed");
                    report.failures.push(KeysignFailure {
                        msg: msg.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    fn validate_keygen(&self, params: &KeygenParams) -> Result<()> {
        if self.backend.lib_type() == LibType::Gg20 {
            // the legacy scheme only signs; new key material always uses the
            // two-curve scheme
            return Err(Error::UnsupportedOperation(format!(
                "{} is not available for legacy vaults",
                params.operation.as_str()
            )));
        }
        // key import may run on a single device; everything else needs a peer
        if params.committee.len() < 2 && params.operation != OperationKind::KeyImport {
            return Err(Error::InvalidConfig(
                "keygen requires at least two parties".into(),
            ));
        }
        if !params.committee.contains(&self.local_party) {
            return Err(Error::InvalidConfig(
                "local party is not part of the committee".into(),
            ));
        }
        match params.operation {
            OperationKind::Migrate => {
                let vault = params.vault.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("migration requires the source vault".into())
                })?;
                if vault.lib_type != LibType::Gg20 {
                    return Err(Error::UnsupportedOperation(
                        "only legacy vaults can be migrated".into(),
                    ));
                }
                // both local shares must exist before any round starts
                if vault.key_share(&vault.pub_key_ecdsa).is_none() {
                    return Err(Error::MissingKeyShare(vault.pub_key_ecdsa.clone()));
                }
                if vault.key_share(&vault.pub_key_eddsa).is_none() {
                    return Err(Error::MissingKeyShare(vault.pub_key_eddsa.clone()));
                }
            }
            OperationKind::Reshare => {
                if params.vault.is_none() && !params.old_committee.is_empty() {
                    return Err(Error::InvalidConfig(
                        "reshare on an old-committee member requires the source vault".into(),
                    ));
                }
            }
            OperationKind::KeyImport => {
                let secret = params.imported_secret.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("key import requires a private key".into())
                })?;
                if hex::decode(secret.as_str()).is_err() {
                    return Err(Error::InvalidConfig(
                        "imported private key is not valid hex".into(),
                    ));
                }
            }
            OperationKind::Keygen => {}
        }
        Ok(())
    }

    /// Per-curve local secrets seeding the new shares (migration and import).
    #[allow(clippy::type_complexity)]
    fn keygen_secrets(
        &self,
        params: &KeygenParams,
    ) -> Result<(Option<Zeroizing<String>>, Option<Zeroizing<String>>)> {
        match params.operation {
            OperationKind::Migrate => {
                let vault = params
                    .vault
                    .as_ref()
                    .ok_or_else(|| Error::InvalidConfig("migration without a vault".into()))?;
                let mut secrets = Vec::with_capacity(2);
                for public_key in [&vault.pub_key_ecdsa, &vault.pub_key_eddsa] {
                    let share = vault
                        .key_share(public_key)
                        .ok_or_else(|| Error::MissingKeyShare(public_key.clone()))?;
                    let raw = self.backend.extract_local_secret(vault, share)?;
                    secrets.push(Zeroizing::new(right_pad_hex(&raw)));
                }
                let eddsa = secrets.pop();
                let ecdsa = secrets.pop();
                Ok((ecdsa, eddsa))
            }
            OperationKind::KeyImport => {
                let secret = params
                    .imported_secret
                    .as_ref()
                    .ok_or_else(|| Error::InvalidConfig("key import without a key".into()))?;
                let padded = Zeroizing::new(right_pad_hex(secret.as_str()));
                Ok((Some(padded.clone()), Some(padded)))
            }
            _ => Ok((None, None)),
        }
    }

    fn keygen_spec(
        &self,
        params: &KeygenParams,
        curve: KeyCurve,
        local_secret: Option<Zeroizing<String>>,
    ) -> PhaseSpec {
        let mut spec = PhaseSpec::keygen(
            params.operation,
            curve,
            self.local_party.clone(),
            params.committee.clone(),
        );
        spec.old_committee = params.old_committee.clone();
        spec.local_secret = local_secret;
        spec.reshare_prefix = params.reshare_prefix.clone();
        spec
    }

    /// Create-and-upload on the initiator, poll-and-download on joiners.
    async fn obtain_setup_message(
        &self,
        params: &KeygenParams,
        spec: &PhaseSpec,
    ) -> Result<Vec<u8>> {
        if params.initiator {
            let setup = self.backend.create_setup_message(spec)?;
            let body = self.cipher.encrypt(BASE64.encode(&setup).as_bytes())?;
            self.transport
                .upload_setup_message(&self.session_id, None, &body)
                .await?;
            debug!(session_id = %self.session_id, "setup message uploaded");
            return Ok(setup);
        }
        for _ in 0..self.config.setup_download_attempts {
            match self
                .transport
                .download_setup_message(&self.session_id, None)
                .await
            {
                Ok(Some(body)) => {
                    let b64 = self.cipher.decrypt(&body)?;
                    let b64 = String::from_utf8(b64).map_err(|e| {
                        Error::SetupMessage(format!("setup body is not utf-8: {e}"))
                    })?;
                    return BASE64
                        .decode(b64.trim())
                        .map_err(|e| Error::SetupMessage(format!("setup base64: {e}")));
                }
                Ok(None) => debug!(session_id = %self.session_id, "setup message not ready"),
                Err(err) => debug!(session_id = %self.session_id, %err, "setup download failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Err(Error::SetupMessage(
            "setup message never appeared on the relay".into(),
        ))
    }

    /// Run one phase, rebuilding driver and puller between attempts.
    /// Transient failures burn an attempt; anything else aborts immediately.
    async fn run_phase_with_retry(
        &self,
        spec: &PhaseSpec,
        operation: &str,
    ) -> Result<RoundArtifact> {
        let mut last_reason = String::new();
        for attempt in 1..=self.config.max_attempts {
            match self.run_phase_once(spec, None).await {
                Ok(artifact) => return Ok(artifact),
                Err(err) if err.is_transient() => {
                    warn!(
                        session_id = %self.session_id,
                        operation,
                        attempt,
                        %err,
                        "phase attempt failed"
                    );
                    last_reason = err.to_string();
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::RetriesExhausted {
            operation: operation.to_string(),
            attempts: self.config.max_attempts,
            reason: last_reason,
        })
    }

    /// One attempt: fresh driver, fresh puller, pump until artifact or
    /// deadline. The puller is stopped on every exit path.
    async fn run_phase_once(
        &self,
        spec: &PhaseSpec,
        message_id: Option<&str>,
    ) -> Result<RoundArtifact> {
        let driver = self.backend.create_driver(spec)?;
        let sender = MessageSender::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.cipher),
            self.session_id.clone(),
            self.local_party.clone(),
            message_id.map(String::from),
        );
        let mut puller = MessagePuller::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.cipher),
            self.session_id.clone(),
            self.local_party.clone(),
            message_id.map(String::from),
        );
        puller.start(Arc::clone(&driver), self.config.poll_interval);

        let result = self.pump(&driver, &sender).await;
        puller.stop();
        result
    }

    async fn pump(
        &self,
        driver: &Arc<dyn RoundDriver>,
        sender: &MessageSender,
    ) -> Result<RoundArtifact> {
        let deadline = Instant::now() + self.config.phase_timeout;
        loop {
            for envelope in driver.drain_outbound()? {
                sender.send(&envelope).await?;
            }
            if let Some(artifact) = driver.try_finish()? {
                return Ok(artifact);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("protocol phase".into()));
            }
            tokio::time::sleep(self.config.pump_interval).await;
        }
    }

    /// Sign one message, preferring a signature a faster peer already
    /// published over re-running rounds.
    async fn sign_one(
        &self,
        params: &KeysignParams,
        msg: &str,
        message_id: &str,
    ) -> Result<SignatureRecord> {
        let mut spec = PhaseSpec::keygen(
            OperationKind::Keygen,
            params.curve,
            self.local_party.clone(),
            params.committee.clone(),
        );
        spec.job = PhaseJob::Keysign;
        spec.message_to_sign = Some(msg.to_string());
        spec.chain_path = params.chain_path.clone();
        spec.key_share = Some(params.key_share.clone());

        let mut last_reason = String::new();
        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                // a peer may have finished while our attempt failed; adopt
                // its signature instead of re-signing
                if let Some(signature) = self.adopt_signature(message_id).await {
                    info!(%message_id, "adopted signature published by a peer");
                    return Ok(signature);
                }
                tokio::time::sleep(self.config.inter_phase_delay).await;
            }
            match self.run_phase_once(&spec, Some(message_id)).await {
                Ok(RoundArtifact::Signature(signature)) => return Ok(signature),
                Ok(RoundArtifact::KeyShare(_)) => {
                    return Err(Error::Internal("keysign phase yielded key material".into()))
                }
                Err(err) if err.is_transient() => {
                    warn!(%message_id, attempt, %err, "keysign attempt failed");
                    last_reason = err.to_string();
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(signature) = self.adopt_signature(message_id).await {
            info!(%message_id, "adopted signature published by a peer");
            return Ok(signature);
        }
        Err(Error::RetriesExhausted {
            operation: "keysign".to_string(),
            attempts: self.config.max_attempts,
            reason: last_reason,
        })
    }

    async fn adopt_signature(&self, message_id: &str) -> Option<SignatureRecord> {
        match self
            .transport
            .check_keysign_complete(&self.session_id, message_id)
            .await
        {
            Ok(found) => found,
            Err(err) => {
                debug!(%message_id, %err, "keysign completion check failed");
                None
            }
        }
    }
}
