//! TSS Party CLI
//!
//! Command-line device for threshold-signature session coordination:
//! - Create a vault (initiator) or join one from a session link
//! - Reshare or migrate an existing vault
//! - Sign messages with a vault's key shares
//!
//! Protocol rounds run on the built-in rehearsal backend; a production
//! deployment swaps in a real cryptography library behind the same seam.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use session_relay_client::RelayClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tss_core::backend::SimBackend;
use tss_core::transport::RelayTransport;
use tss_core::{
    CipherSuite, Committee, DeepLinkPayload, KeyCurve, KeygenInvite, KeygenRequest, KeysignInvite,
    KeysignParams, LibType, OperationKind, ProtocolConfig, ReshareInvite, Session,
    SessionCoordinator, TransportFactory, Vault, VaultStore,
};
use zeroize::Zeroizing;

/// TSS Party - threshold-signature device node
#[derive(Parser)]
#[command(name = "tss-party")]
#[command(about = "Threshold-signature session coordination node")]
#[command(version)]
struct Cli {
    /// Relay service URL
    #[arg(short, long, env = "RELAY_URL", default_value = "http://127.0.0.1:18080")]
    relay: String,

    /// This device's party id
    #[arg(short, long, env = "PARTY_ID")]
    party_id: String,

    /// Data directory for vaults
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault (initiator)
    Create {
        /// Vault name
        #[arg(short, long)]
        name: String,

        /// Number of devices expected to join
        #[arg(short, long, default_value = "2")]
        parties: usize,

        /// Import this hex private key instead of generating a fresh one
        #[arg(long)]
        import_key: Option<String>,
    },

    /// Join a session from a tss:// link
    Join {
        /// Session link printed by the initiator
        link: String,

        /// Private key for joining a key-import session (hex)
        #[arg(long)]
        import_key: Option<String>,
    },

    /// Reshare an existing vault to a new committee (initiator)
    Reshare {
        /// Vault name
        #[arg(short, long)]
        name: String,

        /// Number of devices expected in the new committee
        #[arg(short, long, default_value = "2")]
        parties: usize,

        /// Convert the vault to the newer scheme while resharing
        #[arg(long)]
        migrate: bool,
    },

    /// Sign messages with a vault (initiator)
    Sign {
        /// Vault name
        #[arg(short, long)]
        name: String,

        /// Hex-encoded messages to sign
        #[arg(short, long, required = true)]
        message: Vec<String>,

        /// Number of devices expected to participate
        #[arg(short, long, default_value = "2")]
        parties: usize,
    },

    /// List stored vaults
    Vaults,

    /// Show vault info
    Info {
        /// Vault name
        #[arg(short, long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.dest)?;

    match &cli.command {
        Commands::Create {
            name,
            parties,
            import_key,
        } => run_create(&cli, name, *parties, import_key.as_deref()).await,
        Commands::Join { link, import_key } => run_join(&cli, link, import_key.as_deref()).await,
        Commands::Reshare {
            name,
            parties,
            migrate,
        } => run_reshare(&cli, name, *parties, *migrate).await,
        Commands::Sign {
            name,
            message,
            parties,
        } => run_sign(&cli, name, message, *parties).await,
        Commands::Vaults => show_vaults(&cli),
        Commands::Info { name } => show_info(&cli, name),
    }
}

fn transport_factory() -> Arc<dyn TransportFactory> {
    Arc::new(|address: &str| {
        Ok(Arc::new(RelayClient::new(address)) as Arc<dyn RelayTransport>)
    })
}

fn backend(cli: &Cli) -> Arc<SimBackend> {
    // per-device entropy standing in for the library's key material
    Arc::new(SimBackend::new(
        LibType::Dkls,
        &format!("{}-{}", cli.party_id, uuid::Uuid::new_v4()),
    ))
}

fn store(cli: &Cli) -> VaultStore {
    VaultStore::new(&cli.dest)
}

fn coordinator(cli: &Cli, session: Session) -> Result<SessionCoordinator> {
    Ok(SessionCoordinator::new(
        session,
        cli.party_id.clone(),
        transport_factory(),
        backend(cli),
        ProtocolConfig::default(),
    )?)
}

/// Announce, then poll discovery until `parties` devices are present.
async fn gather_committee(
    coordinator: &mut SessionCoordinator,
    parties: usize,
) -> Result<Committee> {
    coordinator.announce().await?;
    coordinator.start_discovery();
    println!("Waiting for {parties} device(s) to join...");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
    loop {
        let peers = coordinator.discovered_peers();
        if peers.len() >= parties {
            return Ok(Committee::from_parties(peers));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "only {} of {parties} device(s) joined within 5 minutes",
                peers.len()
            ));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn run_create(
    cli: &Cli,
    name: &str,
    parties: usize,
    import_key: Option<&str>,
) -> Result<()> {
    let session = Session::create("Vault", &cli.relay, CipherSuite::default());
    let operation = match import_key {
        Some(_) => OperationKind::KeyImport,
        None => OperationKind::Keygen,
    };
    let link = DeepLinkPayload::Keygen(
        operation,
        KeygenInvite {
            session_id: session.session_id.clone(),
            service_name: session.service_name.clone(),
            encryption_key: session.encryption_key.clone(),
            cipher: session.cipher,
            use_public_relay: true,
            vault_name: name.to_string(),
            lib_type: LibType::Dkls,
        },
    )
    .encode()?;
    println!("Session link (share with the other devices):\n{link}\n");

    let mut coordinator = coordinator(cli, session)?;
    let committee = gather_committee(&mut coordinator, parties).await?;
    coordinator.start_session(committee).await?;

    let vault = coordinator
        .execute_keygen(&KeygenRequest {
            operation,
            vault_name: name.to_string(),
            old_committee: Committee::new(),
            vault: None,
            imported_secret: import_key.map(|k| Zeroizing::new(k.to_string())),
            old_reshare_prefix: None,
        })
        .await?;
    store(cli).save(&vault)?;
    coordinator.end_session().await;

    info!(vault = %vault.name, "vault created");
    print_vault(&vault);
    Ok(())
}

async fn run_join(cli: &Cli, link: &str, import_key: Option<&str>) -> Result<()> {
    let payload = DeepLinkPayload::parse(link)?;
    let store = store(cli);

    match payload {
        DeepLinkPayload::Keygen(operation, invite) => {
            // key import needs the same secret on every device; the link
            // deliberately never carries it
            let imported_secret = match operation {
                OperationKind::KeyImport => Some(Zeroizing::new(
                    import_key
                        .ok_or_else(|| {
                            anyhow!("this session imports a key; pass --import-key")
                        })?
                        .to_string(),
                )),
                _ => None,
            };
            let mut coordinator = join_coordinator(cli, JoinSession {
                session_id: invite.session_id,
                service_name: invite.service_name,
                encryption_key: invite.encryption_key,
                cipher: invite.cipher,
            })?;
            announce_and_wait(&mut coordinator).await?;
            let vault = coordinator
                .execute_keygen(&KeygenRequest {
                    operation,
                    vault_name: invite.vault_name.clone(),
                    old_committee: Committee::new(),
                    vault: None,
                    imported_secret,
                    old_reshare_prefix: None,
                })
                .await?;
            store.save(&vault)?;
            print_vault(&vault);
        }
        DeepLinkPayload::Reshare(operation, invite) => {
            let existing = load_reshare_source(&store, &invite)?;
            let old_reshare_prefix = (!invite.old_reshare_prefix.is_empty())
                .then(|| invite.old_reshare_prefix.clone());
            let mut coordinator = join_coordinator(cli, JoinSession {
                session_id: invite.session_id,
                service_name: invite.service_name,
                encryption_key: invite.encryption_key,
                cipher: invite.cipher,
            })?;
            announce_and_wait(&mut coordinator).await?;
            let vault = coordinator
                .execute_keygen(&KeygenRequest {
                    operation,
                    vault_name: invite.vault_name.clone(),
                    old_committee: Committee::from_parties(invite.old_committee),
                    vault: existing.clone(),
                    imported_secret: None,
                    old_reshare_prefix,
                })
                .await?;
            match existing {
                Some(_) => store.update(&vault)?,
                None => store.save(&vault)?,
            }
            print_vault(&vault);
        }
        DeepLinkPayload::Keysign(invite) => {
            let vault = find_vault_by_key(&store, &invite.public_key_ecdsa)?;
            let key_share = vault
                .key_share(vault.public_key(invite.curve))
                .ok_or_else(|| anyhow!("vault is missing the {:?} share", invite.curve))?
                .clone();
            let mut coordinator = join_coordinator(cli, JoinSession {
                session_id: invite.session_id,
                service_name: invite.service_name,
                encryption_key: invite.encryption_key,
                cipher: invite.cipher,
            })?;
            let committee = announce_and_wait(&mut coordinator).await?;
            let report = coordinator
                .execute_keysign(&KeysignParams {
                    curve: invite.curve,
                    messages: invite.messages,
                    chain_path: None,
                    key_share,
                    committee,
                })
                .await?;
            print_report(&report);
        }
    }
    Ok(())
}

struct JoinSession {
    session_id: String,
    service_name: String,
    encryption_key: tss_core::EncryptionKey,
    cipher: CipherSuite,
}

/// Coordinator for a session this device was invited into.
fn join_coordinator(cli: &Cli, join: JoinSession) -> Result<SessionCoordinator> {
    let session = Session {
        session_id: join.session_id,
        service_name: join.service_name,
        relay_address: cli.relay.trim_end_matches('/').to_string(),
        encryption_key: join.encryption_key,
        cipher: join.cipher,
    };
    coordinator(cli, session)
}

async fn announce_and_wait(coordinator: &mut SessionCoordinator) -> Result<Committee> {
    coordinator.announce().await?;
    println!("Waiting for the initiator to start the session...");
    Ok(coordinator.wait_for_start(Duration::from_secs(120)).await?)
}

async fn run_reshare(cli: &Cli, name: &str, parties: usize, migrate: bool) -> Result<()> {
    let store = store(cli);
    let vault = store
        .load(name)
        .with_context(|| format!("loading vault {name}"))?;
    let operation = if migrate {
        OperationKind::Migrate
    } else {
        OperationKind::Reshare
    };

    let session = Session::create("Vault", &cli.relay, CipherSuite::default());
    let link = DeepLinkPayload::Reshare(
        operation,
        ReshareInvite {
            session_id: session.session_id.clone(),
            service_name: session.service_name.clone(),
            encryption_key: session.encryption_key.clone(),
            cipher: session.cipher,
            use_public_relay: true,
            vault_name: vault.name.clone(),
            public_key_ecdsa: vault.pub_key_ecdsa.clone(),
            hex_chain_code: vault.hex_chain_code.clone(),
            old_committee: vault.signers.as_slice().to_vec(),
            old_reshare_prefix: String::new(),
        },
    )
    .encode()?;
    println!("Session link (share with the other devices):\n{link}\n");

    let mut coordinator = coordinator(cli, session)?;
    let committee = gather_committee(&mut coordinator, parties).await?;
    coordinator.start_session(committee).await?;

    let new_vault = coordinator
        .execute_keygen(&KeygenRequest {
            operation,
            vault_name: vault.name.clone(),
            old_committee: vault.signers.clone(),
            vault: Some(vault),
            imported_secret: None,
            old_reshare_prefix: None,
        })
        .await?;
    store.update(&new_vault)?;
    coordinator.end_session().await;

    info!(vault = %new_vault.name, "vault reshared");
    print_vault(&new_vault);
    Ok(())
}

async fn run_sign(cli: &Cli, name: &str, messages: &[String], parties: usize) -> Result<()> {
    let store = store(cli);
    let vault = store
        .load(name)
        .with_context(|| format!("loading vault {name}"))?;
    let curve = KeyCurve::Ecdsa;
    let key_share = vault
        .key_share(vault.public_key(curve))
        .ok_or_else(|| anyhow!("vault is missing the {curve:?} share"))?
        .clone();

    let session = Session::create("Sign", &cli.relay, CipherSuite::default());
    let link = DeepLinkPayload::Keysign(KeysignInvite {
        session_id: session.session_id.clone(),
        service_name: session.service_name.clone(),
        encryption_key: session.encryption_key.clone(),
        cipher: session.cipher,
        use_public_relay: true,
        public_key_ecdsa: vault.pub_key_ecdsa.clone(),
        curve,
        messages: messages.to_vec(),
    })
    .encode()?;
    println!("Session link (share with the other devices):\n{link}\n");

    let mut coordinator = coordinator(cli, session)?;
    let committee = gather_committee(&mut coordinator, parties).await?;
    coordinator.start_session(committee.clone()).await?;

    let report = coordinator
        .execute_keysign(&KeysignParams {
            curve,
            messages: messages.to_vec(),
            chain_path: None,
            key_share,
            committee,
        })
        .await?;
    coordinator.end_session().await;
    print_report(&report);
    Ok(())
}

fn show_vaults(cli: &Cli) -> Result<()> {
    let names = store(cli).list()?;
    if names.is_empty() {
        println!("No vaults stored in {}", cli.dest.display());
        return Ok(());
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn show_info(cli: &Cli, name: &str) -> Result<()> {
    let vault = store(cli).load(name)?;
    print_vault(&vault);
    Ok(())
}

fn load_reshare_source(store: &VaultStore, invite: &ReshareInvite) -> Result<Option<Vault>> {
    match store.load(&invite.vault_name) {
        Ok(vault) => {
            // a device holding a different vault under the same name must
            // not feed its shares into someone else's reshare
            if vault.pub_key_ecdsa != invite.public_key_ecdsa {
                return Err(anyhow!(
                    "stored vault {} does not match the session's public key",
                    invite.vault_name
                ));
            }
            Ok(Some(vault))
        }
        // a brand new device joins the reshare without old shares
        Err(_) => Ok(None),
    }
}

fn find_vault_by_key(store: &VaultStore, public_key_ecdsa: &str) -> Result<Vault> {
    for name in store.list()? {
        if let Ok(vault) = store.load(&name) {
            if vault.pub_key_ecdsa == public_key_ecdsa {
                return Ok(vault);
            }
        }
    }
    Err(anyhow!(
        "no stored vault holds a share of {public_key_ecdsa}"
    ))
}

fn print_vault(vault: &Vault) {
    println!("Vault: {}", vault.name);
    println!("  Scheme: {:?}", vault.lib_type);
    println!("  Signers: {}", vault.signers.as_slice().join(", "));
    println!("  ECDSA public key: {}", vault.pub_key_ecdsa);
    println!("  EdDSA public key: {}", vault.pub_key_eddsa);
    println!("  Chain code: {}", vault.hex_chain_code);
}

fn print_report(report: &tss_core::KeysignReport) {
    for (msg, signature) in &report.signatures {
        println!("Signed {msg}:");
        println!("  r: {}", signature.r);
        println!("  s: {}", signature.s);
        println!("  v: {}", signature.recovery_id);
        println!("  DER: {}", signature.der_signature);
    }
    for failure in &report.failures {
        println!("FAILED {}: {}", failure.msg, failure.reason);
    }
}
