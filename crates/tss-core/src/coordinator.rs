//! Session coordinator.
//!
//! Owns the lifecycle of one coordination session: announce, discover peers,
//! optionally switch relays, freeze the committee, then drive the protocol
//! runner, the completion barrier and vault materialization in order. One
//! coordinator handles exactly one operation and is dropped afterwards.

use crate::barrier::CompletionBarrier;
use crate::config::ProtocolConfig;
use crate::discovery::ParticipantDiscovery;
use crate::driver::ProtocolBackend;
use crate::encryption::SessionCipher;
use crate::materializer::VaultMaterializer;
use crate::puller::MessagePuller;
use crate::runner::{KeygenOutcome, KeygenParams, KeysignParams, KeysignReport, ProtocolRunner};
use crate::transport::RelayTransport;
use crate::{Committee, Error, OperationKind, PartyId, Result, Session, Vault};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Builds a transport for a relay address. Lets the coordinator hop between
/// the local-network mediator and the public relay before the session starts.
pub trait TransportFactory: Send + Sync {
    fn create(&self, relay_address: &str) -> Result<Arc<dyn RelayTransport>>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn RelayTransport>> + Send + Sync,
{
    fn create(&self, relay_address: &str) -> Result<Arc<dyn RelayTransport>> {
        self(relay_address)
    }
}

/// Inputs for a keygen-flavored operation, supplied by the caller before the
/// committee is known
pub struct KeygenRequest {
    pub operation: OperationKind,
    pub vault_name: String,
    /// Devices holding shares of the old key (reshare/migrate)
    pub old_committee: Committee,
    /// Source vault for reshare/migrate
    pub vault: Option<Vault>,
    /// Hex private key for key import
    pub imported_secret: Option<Zeroizing<String>>,
    /// Version tag from the vault's previous reshare, carried by the invite
    pub old_reshare_prefix: Option<String>,
}

pub struct SessionCoordinator {
    session: Session,
    local_party: PartyId,
    factory: Arc<dyn TransportFactory>,
    transport: Arc<dyn RelayTransport>,
    cipher: Arc<SessionCipher>,
    backend: Arc<dyn ProtocolBackend>,
    config: ProtocolConfig,
    discovery: Option<ParticipantDiscovery>,
    /// Frozen at session start; `None` until then
    committee: Option<Committee>,
    /// True on the device that called `start_session`
    initiator: bool,
}

impl SessionCoordinator {
    pub fn new(
        session: Session,
        local_party: PartyId,
        factory: Arc<dyn TransportFactory>,
        backend: Arc<dyn ProtocolBackend>,
        config: ProtocolConfig,
    ) -> Result<Self> {
        let transport = factory.create(&session.relay_address)?;
        let cipher = Arc::new(SessionCipher::new(&session.encryption_key, session.cipher)?);
        Ok(Self {
            session,
            local_party,
            factory,
            transport,
            cipher,
            backend,
            config,
            discovery: None,
            committee: None,
            initiator: false,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The frozen committee, once the session started.
    pub fn committee(&self) -> Option<&Committee> {
        self.committee.as_ref()
    }

    /// Register the local party's presence so peers can discover it.
    pub async fn announce(&self) -> Result<()> {
        self.transport
            .register_party(&self.session.session_id, &self.local_party)
            .await
    }

    /// Begin polling the relay for participants.
    pub fn start_discovery(&mut self) {
        let mut discovery = ParticipantDiscovery::new(
            Arc::clone(&self.transport),
            self.session.session_id.clone(),
            self.local_party.clone(),
        );
        discovery.start(self.config.poll_interval);
        self.discovery = Some(discovery);
    }

    /// Parties discovered so far, the local party included.
    pub fn discovered_peers(&self) -> Vec<PartyId> {
        match &self.discovery {
            Some(discovery) => discovery.peers(),
            None => vec![self.local_party.clone()],
        }
    }

    pub fn subscribe_peers(&self) -> Option<watch::Receiver<Vec<PartyId>>> {
        self.discovery.as_ref().map(|d| d.subscribe())
    }

    /// Move the session to a different relay. Only legal before the session
    /// starts; the discovered peer set resets because presence on the old
    /// relay says nothing about the new one.
    pub async fn switch_relay(&mut self, relay_address: &str) -> Result<()> {
        if self.committee.is_some() {
            return Err(Error::InvalidConfig(
                "cannot switch relays after the session started".into(),
            ));
        }
        let transport = self.factory.create(relay_address)?;
        self.session.relay_address = relay_address.trim_end_matches('/').to_string();
        self.transport = Arc::clone(&transport);
        if let Some(discovery) = &mut self.discovery {
            discovery.restart(transport, self.config.poll_interval).await;
        }
        info!(relay = %self.session.relay_address, "switched relay");
        Ok(())
    }

    /// Freeze the committee and signal every participant to begin. Initiator
    /// only; parties that register afterwards are not part of the operation.
    pub async fn start_session(&mut self, committee: Committee) -> Result<()> {
        if self.committee.is_some() {
            return Err(Error::InvalidConfig("session already started".into()));
        }
        if !committee.contains(&self.local_party) {
            return Err(Error::InvalidConfig(
                "local party is not part of the committee".into(),
            ));
        }
        self.transport
            .start_session(&self.session.session_id, committee.as_slice())
            .await?;
        self.stop_discovery();
        info!(
            session_id = %self.session.session_id,
            parties = committee.len(),
            "session started"
        );
        self.committee = Some(committee);
        self.initiator = true;
        Ok(())
    }

    /// Joiner side: poll until the initiator starts the session, then adopt
    /// its frozen committee.
    pub async fn wait_for_start(&mut self, timeout: Duration) -> Result<Committee> {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .transport
                .started_committee(&self.session.session_id)
                .await
            {
                Ok(Some(parties)) => {
                    let committee = Committee::from_parties(parties);
                    if !committee.contains(&self.local_party) {
                        return Err(Error::VaultMismatch(
                            "local party is not part of the started committee".into(),
                        ));
                    }
                    self.stop_discovery();
                    self.committee = Some(committee.clone());
                    return Ok(committee);
                }
                Ok(None) => debug!(session_id = %self.session.session_id, "session not started"),
                Err(err) => debug!(session_id = %self.session.session_id, %err, "start poll failed"),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("session start".into()));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Run a keygen-flavored operation end to end and materialize the vault.
    ///
    /// The vault exists only if the local rounds succeeded AND every
    /// committee member confirmed completion within the barrier ceiling.
    pub async fn execute_keygen(&self, request: &KeygenRequest) -> Result<Vault> {
        let committee = self.require_committee()?;
        let runner = self.runner();
        let params = KeygenParams {
            operation: request.operation,
            committee: committee.clone(),
            old_committee: request.old_committee.clone(),
            initiator: self.initiator,
            vault: request.vault.clone(),
            imported_secret: request.imported_secret.clone(),
            reshare_prefix: request.old_reshare_prefix.clone(),
        };

        let outcome = match runner.run_keygen(&params).await {
            Ok(outcome) => outcome,
            Err(err) => {
                runner.mark_failed(&err.to_string());
                return Err(err);
            }
        };

        if let Err(err) = self.confirm_committee(committee).await {
            runner.mark_failed(&err.to_string());
            return Err(err);
        }

        let vault = self.materialize(request, committee, &outcome)?;
        runner.mark_finished();
        Ok(vault)
    }

    /// Run a keysign operation. Signatures for messages that succeeded are
    /// returned even when a later message failed.
    pub async fn execute_keysign(&self, params: &KeysignParams) -> Result<KeysignReport> {
        let runner = self.runner();
        let report = match runner.run_keysign(params).await {
            Ok(report) => report,
            Err(err) => {
                runner.mark_failed(&err.to_string());
                return Err(err);
            }
        };
        if report.failures.is_empty() {
            runner.mark_finished();
        } else {
            runner.mark_failed(&format!(
                "{} of {} messages failed",
                report.failures.len(),
                report.failures.len() + report.signatures.len()
            ));
        }
        Ok(report)
    }

    /// Runner bound to this session, exposed so callers can watch status.
    pub fn runner(&self) -> ProtocolRunner {
        ProtocolRunner::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.backend),
            Arc::clone(&self.cipher),
            self.session.session_id.clone(),
            self.local_party.clone(),
            self.config.clone(),
        )
    }

    /// Puller bound to this session, for callers that drive a custom phase.
    pub fn puller(&self, message_id: Option<String>) -> MessagePuller {
        MessagePuller::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.cipher),
            self.session.session_id.clone(),
            self.local_party.clone(),
            message_id,
        )
    }

    fn require_committee(&self) -> Result<&Committee> {
        self.committee
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("session has not started".into()))
    }

    async fn confirm_committee(&self, committee: &Committee) -> Result<()> {
        let barrier = CompletionBarrier::new(
            Arc::clone(&self.transport),
            self.session.session_id.clone(),
            self.local_party.clone(),
            committee.clone(),
            self.config.poll_interval,
            self.config.barrier_timeout,
        );
        barrier.mark_local_complete().await;
        if barrier.wait_for_all().await {
            return Ok(());
        }
        let done = self
            .transport
            .completed_parties(&self.session.session_id)
            .await
            .unwrap_or_default();
        Err(Error::IncompleteCommittee(committee.missing_from(&done)))
    }

    fn materialize(
        &self,
        request: &KeygenRequest,
        committee: &Committee,
        outcome: &KeygenOutcome,
    ) -> Result<Vault> {
        VaultMaterializer::materialize(
            &request.vault_name,
            &self.local_party,
            committee,
            request.operation,
            outcome,
        )
    }

    /// Best-effort relay cleanup. The caller invokes this on the initiator
    /// once the operation is over; joiners may still be reading completion
    /// marks, so it never runs implicitly.
    pub async fn end_session(&self) {
        if !self.initiator {
            return;
        }
        if let Err(err) = self.transport.delete_session(&self.session.session_id).await {
            warn!(session_id = %self.session.session_id, %err, "session cleanup failed");
        }
    }

    fn stop_discovery(&mut self) {
        if let Some(discovery) = &mut self.discovery {
            discovery.stop();
        }
        self.discovery = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimBackend;
    use crate::encryption::CipherSuite;
    use crate::transport::MemoryTransport;
    use crate::LibType;

    fn factory(relay: Arc<MemoryTransport>) -> Arc<dyn TransportFactory> {
        Arc::new(move |_address: &str| -> Result<Arc<dyn RelayTransport>> {
            Ok(relay.clone() as Arc<dyn RelayTransport>)
        })
    }

    fn coordinator(
        relay: Arc<MemoryTransport>,
        session: Session,
        party: &str,
        seed: &str,
    ) -> SessionCoordinator {
        SessionCoordinator::new(
            session,
            party.into(),
            factory(relay),
            Arc::new(SimBackend::new(LibType::Dkls, seed)),
            ProtocolConfig::fast(),
        )
        .unwrap()
    }

    fn keygen_request(name: &str) -> KeygenRequest {
        KeygenRequest {
            operation: OperationKind::Keygen,
            vault_name: name.into(),
            old_committee: Committee::new(),
            vault: None,
            imported_secret: None,
            old_reshare_prefix: None,
        }
    }

    #[tokio::test]
    async fn full_two_party_keygen() {
        let relay = Arc::new(MemoryTransport::new());
        let session = Session::create("Vault", "http://relay", CipherSuite::AesGcm);
        let mut alice = coordinator(relay.clone(), session.clone(), "a", "seed-a");
        let mut bob = coordinator(relay.clone(), session.clone(), "b", "seed-b");

        alice.announce().await.unwrap();
        alice.start_discovery();
        bob.announce().await.unwrap();
        bob.start_discovery();

        // initiator waits until discovery sees both devices
        tokio::time::timeout(Duration::from_secs(2), async {
            while alice.discovered_peers().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer never discovered");

        let committee = Committee::from_parties(alice.discovered_peers());
        alice.start_session(committee).await.unwrap();

        let request_a = keygen_request("Main Vault");
        let (vault_a, vault_b) = tokio::join!(
            alice.execute_keygen(&request_a),
            async {
                bob.wait_for_start(Duration::from_secs(2)).await.unwrap();
                bob.execute_keygen(&keygen_request("Main Vault")).await
            }
        );
        let vault_a = vault_a.unwrap();
        let vault_b = vault_b.unwrap();

        assert_eq!(vault_a.pub_key_ecdsa, vault_b.pub_key_ecdsa);
        assert_eq!(vault_a.pub_key_eddsa, vault_b.pub_key_eddsa);
        assert_eq!(vault_a.signers, vault_b.signers);
        assert_eq!(vault_a.local_party_id, "a");
        assert_eq!(vault_b.local_party_id, "b");
    }

    #[tokio::test]
    async fn keygen_before_start_is_rejected() {
        let relay = Arc::new(MemoryTransport::new());
        let session = Session::create("Vault", "http://relay", CipherSuite::AesGcm);
        let alice = coordinator(relay, session, "a", "seed-a");
        let err = alice
            .execute_keygen(&keygen_request("Main Vault"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn relay_switch_after_start_is_rejected() {
        let relay = Arc::new(MemoryTransport::new());
        let session = Session::create("Vault", "http://relay", CipherSuite::AesGcm);
        let mut alice = coordinator(relay, session, "a", "seed-a");
        alice
            .start_session(Committee::from_parties(["a", "b"]))
            .await
            .unwrap();
        let err = alice.switch_relay("http://other").await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn late_registrant_is_not_in_the_frozen_committee() {
        let relay = Arc::new(MemoryTransport::new());
        let session = Session::create("Vault", "http://relay", CipherSuite::AesGcm);
        let mut alice = coordinator(relay.clone(), session.clone(), "a", "seed-a");

        alice
            .start_session(Committee::from_parties(["a", "b"]))
            .await
            .unwrap();
        // c shows up after the freeze
        relay
            .register_party(&session.session_id, "c")
            .await
            .unwrap();

        let started = relay
            .started_committee(&session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started, vec!["a", "b"]);
        assert!(!alice.committee().unwrap().contains("c"));
    }

    #[tokio::test]
    async fn barrier_timeout_fails_without_a_vault() {
        let relay = Arc::new(MemoryTransport::new());
        let session = Session::create("Vault", "http://relay", CipherSuite::AesGcm);
        let mut alice = coordinator(relay.clone(), session.clone(), "a", "seed-a");
        let mut bob = coordinator(relay.clone(), session.clone(), "b", "seed-b");

        alice
            .start_session(Committee::from_parties(["a", "b"]))
            .await
            .unwrap();

        // bob runs the rounds but never reaches the barrier
        let bob_rounds = tokio::spawn(async move {
            bob.wait_for_start(Duration::from_secs(2)).await.unwrap();
            let runner = bob.runner();
            runner
                .run_keygen(&crate::runner::KeygenParams {
                    operation: OperationKind::Keygen,
                    committee: Committee::from_parties(["a", "b"]),
                    old_committee: Committee::new(),
                    initiator: false,
                    vault: None,
                    imported_secret: None,
                    reshare_prefix: None,
                })
                .await
        });

        let err = alice
            .execute_keygen(&keygen_request("Main Vault"))
            .await
            .unwrap_err();
        match err {
            Error::IncompleteCommittee(missing) => assert_eq!(missing, vec!["b"]),
            other => panic!("unexpected error: {other}"),
        }
        bob_rounds.await.unwrap().unwrap();
    }
}
