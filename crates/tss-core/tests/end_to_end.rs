//! End-to-end flows over an in-memory relay: two devices run full
//! operations against each other exactly as they would over HTTP.

use std::sync::Arc;
use std::time::Duration;
use tss_core::backend::SimBackend;
use tss_core::driver::PhaseJob;
use tss_core::transport::{MemoryTransport, RelayTransport};
use tss_core::{
    message_hash, CipherSuite, Committee, EncryptionKey, Error, KeyCurve, KeygenParams,
    KeygenRequest, KeysignParams, OperationKind, ProtocolConfig, ProtocolRunner, Session,
    SessionCipher, SessionCoordinator, TransportFactory, Vault, VaultStore,
};

fn factory(relay: Arc<MemoryTransport>) -> Arc<dyn TransportFactory> {
    Arc::new(move |_address: &str| Ok(relay.clone() as Arc<dyn RelayTransport>))
}

fn coordinator(
    relay: Arc<MemoryTransport>,
    session: Session,
    party: &str,
    backend: Arc<SimBackend>,
) -> SessionCoordinator {
    SessionCoordinator::new(
        session,
        party.into(),
        factory(relay),
        backend,
        ProtocolConfig::fast(),
    )
    .unwrap()
}

fn runner(
    relay: Arc<MemoryTransport>,
    key: &EncryptionKey,
    party: &str,
    backend: Arc<SimBackend>,
) -> ProtocolRunner {
    runner_with_config(relay, key, party, backend, ProtocolConfig::fast())
}

fn runner_with_config(
    relay: Arc<MemoryTransport>,
    key: &EncryptionKey,
    party: &str,
    backend: Arc<SimBackend>,
    config: ProtocolConfig,
) -> ProtocolRunner {
    let cipher = Arc::new(SessionCipher::new(key, CipherSuite::AesGcm).unwrap());
    ProtocolRunner::new(relay, backend, cipher, "e2e".into(), party.into(), config)
}

fn legacy_vault(party: &str) -> Vault {
    // a gg20-era vault holding both local shares
    let ecdsa = tss_core::KeyShare {
        public_key: "02abcd".into(),
        share: format!("{party}-ecdsa-blob"),
        chain_code: "1234".into(),
    };
    let eddsa = tss_core::KeyShare {
        public_key: "ef01".into(),
        share: format!("{party}-eddsa-blob"),
        chain_code: "1234".into(),
    };
    Vault {
        name: "Legacy Vault".into(),
        local_party_id: party.into(),
        signers: Committee::from_parties(["a", "b"]),
        pub_key_ecdsa: ecdsa.public_key.clone(),
        pub_key_eddsa: eddsa.public_key.clone(),
        hex_chain_code: "1234".into(),
        lib_type: tss_core::LibType::Gg20,
        key_shares: vec![ecdsa, eddsa],
    }
}

#[tokio::test]
async fn keygen_then_keysign_with_the_materialized_vault() {
    let relay = Arc::new(MemoryTransport::new());
    let session = Session::create("Vault", "http://relay", CipherSuite::AesGcm);
    let backend_a = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-a"));
    let backend_b = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-b"));
    let mut alice = coordinator(relay.clone(), session.clone(), "a", backend_a);
    let mut bob = coordinator(relay.clone(), session.clone(), "b", backend_b);

    alice.announce().await.unwrap();
    bob.announce().await.unwrap();
    alice
        .start_session(Committee::from_parties(["a", "b"]))
        .await
        .unwrap();

    let request = || KeygenRequest {
        operation: OperationKind::Keygen,
        vault_name: "Main Vault".into(),
        old_committee: Committee::new(),
        vault: None,
        imported_secret: None,
        old_reshare_prefix: None,
    };
    let req_a = request();
    let (vault_a, vault_b) = tokio::join!(alice.execute_keygen(&req_a), async {
        bob.wait_for_start(Duration::from_secs(2)).await.unwrap();
        bob.execute_keygen(&request()).await
    });
    let vault_a = vault_a.unwrap();
    let vault_b = vault_b.unwrap();
    assert_eq!(vault_a.pub_key_ecdsa, vault_b.pub_key_ecdsa);

    // persist, reload, then sign with the stored share
    let dir = tempfile::tempdir().unwrap();
    let store = VaultStore::new(dir.path());
    store.save(&vault_a).unwrap();
    let loaded = store.load("Main Vault").unwrap();

    let share_a = loaded.key_share(&loaded.pub_key_ecdsa).unwrap().clone();
    let share_b = vault_b.key_share(&vault_b.pub_key_ecdsa).unwrap().clone();
    let params = |share: tss_core::KeyShare| KeysignParams {
        curve: KeyCurve::Ecdsa,
        messages: vec!["deadbeef".into()],
        chain_path: None,
        key_share: share,
        committee: Committee::from_parties(["a", "b"]),
    };
    let params_a = params(share_a);
    let params_b = params(share_b);
    let (rep_a, rep_b) = tokio::join!(
        alice.execute_keysign(&params_a),
        bob.execute_keysign(&params_b),
    );
    let rep_a = rep_a.unwrap();
    assert_eq!(rep_a.signatures, rep_b.unwrap().signatures);
    assert!(rep_a.signatures.contains_key("deadbeef"));

    alice.end_session().await;
}

#[tokio::test]
async fn reshare_threads_the_prefix_from_ecdsa_to_eddsa() {
    let relay = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let backend_a = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-a"));
    let backend_b = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-b"));
    let runner_a = runner(relay.clone(), &key, "a", backend_a.clone());
    let runner_b = runner(relay.clone(), &key, "b", backend_b);

    let params = |party: &str, initiator: bool| KeygenParams {
        operation: OperationKind::Reshare,
        committee: Committee::from_parties(["a", "b"]),
        old_committee: Committee::from_parties(["a", "b"]),
        initiator,
        vault: Some(legacy_vault(party)),
        imported_secret: None,
        reshare_prefix: Some("prior-prefix".into()),
    };
    let params_a = params("a", true);
    let params_b = params("b", false);
    let (out_a, out_b) = tokio::join!(
        runner_a.run_keygen(&params_a),
        runner_b.run_keygen(&params_b),
    );
    let out_a = out_a.unwrap();
    let out_b = out_b.unwrap();
    assert_eq!(out_a.ecdsa.public_key, out_b.ecdsa.public_key);

    let records = backend_a.records();
    let phases: Vec<_> = records
        .iter()
        .filter(|r| matches!(r.job, PhaseJob::Keygen(OperationKind::Reshare)))
        .collect();
    assert_eq!(phases.len(), 2);
    // the ecdsa phase received the vault's stored prefix unchanged
    assert_eq!(phases[0].curve, KeyCurve::Ecdsa);
    assert_eq!(phases[0].reshare_prefix.as_deref(), Some("prior-prefix"));
    // the eddsa phase received exactly the prefix the ecdsa phase produced
    let ecdsa_outcome = backend_a
        .outcomes()
        .into_iter()
        .find(|o| o.curve == KeyCurve::Ecdsa)
        .expect("ecdsa phase completed");
    assert_eq!(phases[1].curve, KeyCurve::Eddsa);
    assert!(ecdsa_outcome.reshare_prefix.is_some());
    assert_eq!(phases[1].reshare_prefix, ecdsa_outcome.reshare_prefix);
}

#[tokio::test]
async fn migration_converts_a_legacy_vault() {
    let relay = Arc::new(MemoryTransport::new());
    let session = Session::create("Vault", "http://relay", CipherSuite::AesGcm);
    let backend_a = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-a"));
    let backend_b = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-b"));
    let mut alice = coordinator(relay.clone(), session.clone(), "a", backend_a);
    let mut bob = coordinator(relay.clone(), session.clone(), "b", backend_b);

    alice
        .start_session(Committee::from_parties(["a", "b"]))
        .await
        .unwrap();

    let request = |party: &str| KeygenRequest {
        operation: OperationKind::Migrate,
        vault_name: "Legacy Vault".into(),
        old_committee: Committee::from_parties(["a", "b"]),
        vault: Some(legacy_vault(party)),
        imported_secret: None,
        old_reshare_prefix: None,
    };
    let req_a = request("a");
    let req_b = request("b");
    let (vault_a, vault_b) = tokio::join!(alice.execute_keygen(&req_a), async {
        bob.wait_for_start(Duration::from_secs(2)).await.unwrap();
        bob.execute_keygen(&req_b).await
    });
    let vault_a = vault_a.unwrap();
    let vault_b = vault_b.unwrap();

    assert_eq!(vault_a.lib_type, tss_core::LibType::Dkls);
    assert_eq!(vault_a.pub_key_ecdsa, vault_b.pub_key_ecdsa);
    // the migrated vault is new key material
    assert_ne!(vault_a.pub_key_ecdsa, "02abcd");
}

#[tokio::test]
async fn key_import_seeds_deterministic_material() {
    let relay = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let secret = "ab".repeat(20);

    let run = |relay: Arc<MemoryTransport>, key: EncryptionKey, secret: String| async move {
        let backend_a = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-a"));
        let backend_b = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-b"));
        let runner_a = runner(relay.clone(), &key, "a", backend_a);
        let runner_b = runner(relay, &key, "b", backend_b);
        let params = |initiator| KeygenParams {
            operation: OperationKind::KeyImport,
            committee: Committee::from_parties(["a", "b"]),
            old_committee: Committee::new(),
            initiator,
            vault: None,
            imported_secret: Some(zeroize::Zeroizing::new(secret.clone())),
            reshare_prefix: None,
        };
        let params_a = params(true);
        let params_b = params(false);
        let (a, b) = tokio::join!(
            runner_a.run_keygen(&params_a),
            runner_b.run_keygen(&params_b)
        );
        (a.unwrap(), b.unwrap())
    };

    let (first_a, first_b) = run(relay, key.clone(), secret.clone()).await;
    assert_eq!(first_a.ecdsa.public_key, first_b.ecdsa.public_key);

    // importing the same key on a fresh relay reproduces the same public key
    let (second_a, _) = run(Arc::new(MemoryTransport::new()), key, secret).await;
    assert_eq!(first_a.ecdsa.public_key, second_a.ecdsa.public_key);
}

#[tokio::test]
async fn slow_signer_adopts_a_published_signature() {
    let relay = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let backend = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-a"));
    // every local attempt fails; only adoption can produce a signature
    backend.fail_next_phases(3);
    let runner_a = runner(relay.clone(), &key, "a", backend);

    let msg = "deadbeef".to_string();
    let published = tss_core::SignatureRecord {
        msg: msg.clone(),
        r: "11".repeat(32),
        s: "22".repeat(32),
        recovery_id: "00".into(),
        der_signature: "sig".into(),
    };
    relay
        .mark_keysign_complete("e2e", &message_hash(&msg), &published)
        .await
        .unwrap();

    let report = runner_a
        .run_keysign(&KeysignParams {
            curve: KeyCurve::Ecdsa,
            messages: vec![msg.clone()],
            chain_path: None,
            key_share: tss_core::KeyShare {
                public_key: "02aa".into(),
                share: "blob".into(),
                chain_code: "cc".into(),
            },
            committee: Committee::from_parties(["a", "b"]),
        })
        .await
        .unwrap();
    assert_eq!(report.signatures.get(&msg), Some(&published));
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn keysign_failure_keeps_earlier_signatures() {
    let relay = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let backend_a = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-a"));
    let backend_b = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-b"));
    // short phase ceiling so the abandoned second message fails quickly
    let config = ProtocolConfig::fast().with_phase_timeout(Duration::from_millis(300));
    let runner_a = runner_with_config(relay.clone(), &key, "a", backend_a.clone(), config.clone());
    let runner_b = runner_with_config(relay.clone(), &key, "b", backend_b, config);

    let params = || KeysignParams {
        curve: KeyCurve::Ecdsa,
        messages: vec!["aa01".into(), "aa02".into()],
        chain_path: None,
        key_share: tss_core::KeyShare {
            public_key: "02aa".into(),
            share: "blob".into(),
            chain_code: "cc".into(),
        },
        committee: Committee::from_parties(["a", "b"]),
    };

    // b only participates in the first message
    let b_task = tokio::spawn(async move {
        let mut p = params();
        p.messages.truncate(1);
        runner_b.run_keysign(&p).await
    });
    let report = runner_a.run_keysign(&params()).await.unwrap();
    b_task.await.unwrap().unwrap();

    assert!(report.signatures.contains_key("aa01"));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].msg, "aa02");
}

#[tokio::test]
async fn exhausted_retries_surface_the_reason() {
    let relay = Arc::new(MemoryTransport::new());
    let key = EncryptionKey::generate();
    let backend = Arc::new(SimBackend::new(tss_core::LibType::Dkls, "seed-a"));
    backend.fail_next_phases(3);
    let runner_a = runner(relay, &key, "a", backend);

    let err = runner_a
        .run_keygen(&KeygenParams {
            operation: OperationKind::Keygen,
            committee: Committee::from_parties(["a", "b"]),
            old_committee: Committee::new(),
            initiator: true,
            vault: None,
            imported_secret: None,
            reshare_prefix: None,
        })
        .await
        .unwrap_err();
    match err {
        Error::RetriesExhausted {
            operation,
            attempts,
            reason,
        } => {
            assert_eq!(operation, "keygen-ecdsa");
            assert_eq!(attempts, 3);
            assert!(reason.contains("library failure"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}
