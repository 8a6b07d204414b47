//! Vault materialization and persistence.
//!
//! A vault is assembled only after the completion barrier confirmed that
//! every committee member finished its rounds; nothing here runs on the
//! failure path, so a vault is never persisted partially.

use crate::runner::KeygenOutcome;
use crate::{Committee, Error, LibType, OperationKind, PartyId, Result, Vault};
use std::path::{Path, PathBuf};
use tracing::info;

/// Builds a [`Vault`] from a completed keygen outcome
pub struct VaultMaterializer;

impl VaultMaterializer {
    /// Assemble the vault. Rejects incomplete outcomes so a half-finished
    /// operation can never look like a healthy vault.
    pub fn materialize(
        name: &str,
        local_party: &PartyId,
        committee: &Committee,
        operation: OperationKind,
        outcome: &KeygenOutcome,
    ) -> Result<Vault> {
        if name.trim().is_empty() {
            return Err(Error::InvalidConfig("vault name is empty".into()));
        }
        for share in [&outcome.ecdsa, &outcome.eddsa] {
            if share.public_key.is_empty() || share.share.is_empty() {
                return Err(Error::Internal(
                    "keygen outcome is missing key material".into(),
                ));
            }
        }
        // migration always lands on the newer scheme regardless of the
        // backend that reported it
        let lib_type = match operation {
            OperationKind::Migrate => LibType::Dkls,
            _ => outcome.lib_type,
        };
        let vault = Vault {
            name: name.to_string(),
            local_party_id: local_party.clone(),
            signers: committee.clone(),
            pub_key_ecdsa: outcome.ecdsa.public_key.clone(),
            pub_key_eddsa: outcome.eddsa.public_key.clone(),
            hex_chain_code: outcome.ecdsa.chain_code.clone(),
            lib_type,
            key_shares: vec![outcome.ecdsa.clone(), outcome.eddsa.clone()],
        };
        info!(vault = %vault.name, parties = committee.len(), "vault materialized");
        Ok(vault)
    }
}

/// JSON-file vault storage, one file per vault
pub struct VaultStore {
    dir: PathBuf,
}

impl VaultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        // vault names may contain path-hostile characters
        let safe: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Persist a new vault. Names are unique: saving over an existing vault
    /// is rejected rather than silently overwriting key material.
    pub fn save(&self, vault: &Vault) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&vault.name);
        if path.exists() {
            return Err(Error::DuplicateVaultName(vault.name.clone()));
        }
        let json = serde_json::to_vec_pretty(vault)?;
        std::fs::write(&path, json)?;
        info!(vault = %vault.name, path = %path.display(), "vault saved");
        Ok(())
    }

    /// Replace an existing vault in place (reshare/migrate result).
    pub fn update(&self, vault: &Vault) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(vault)?;
        std::fs::write(self.path_for(&vault.name), json)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Vault> {
        let path = self.path_for(name);
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Deserialization(format!("{}: {e}", path.display())))
    }

    /// Names of every stored vault.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Ok(vault) = Self::load_path(&path) {
                    names.push(vault.name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn load_path(path: &Path) -> Result<Vault> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyShare;

    fn outcome() -> KeygenOutcome {
        KeygenOutcome {
            ecdsa: KeyShare {
                public_key: "02aa".into(),
                share: "ecdsa-blob".into(),
                chain_code: "cc".into(),
            },
            eddsa: KeyShare {
                public_key: "bb".into(),
                share: "eddsa-blob".into(),
                chain_code: "cc".into(),
            },
            lib_type: LibType::Dkls,
        }
    }

    fn committee() -> Committee {
        Committee::from_parties(["a", "b"])
    }

    #[test]
    fn materialize_builds_both_shares() {
        let vault = VaultMaterializer::materialize(
            "Main Vault",
            &"a".to_string(),
            &committee(),
            OperationKind::Keygen,
            &outcome(),
        )
        .unwrap();
        assert_eq!(vault.pub_key_ecdsa, "02aa");
        assert_eq!(vault.pub_key_eddsa, "bb");
        assert_eq!(vault.key_shares.len(), 2);
        assert_eq!(vault.lib_type, LibType::Dkls);
        assert!(vault.key_share("02aa").is_some());
    }

    #[test]
    fn migration_result_is_always_the_newer_scheme() {
        let vault = VaultMaterializer::materialize(
            "Migrated",
            &"a".to_string(),
            &committee(),
            OperationKind::Migrate,
            &outcome(),
        )
        .unwrap();
        assert_eq!(vault.lib_type, LibType::Dkls);
    }

    #[test]
    fn empty_outcome_is_rejected() {
        let mut bad = outcome();
        bad.eddsa.share.clear();
        let err = VaultMaterializer::materialize(
            "Bad",
            &"a".to_string(),
            &committee(),
            OperationKind::Keygen,
            &bad,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn store_round_trips_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = VaultStore::new(dir.path());
        let vault = VaultMaterializer::materialize(
            "My Vault",
            &"a".to_string(),
            &committee(),
            OperationKind::Keygen,
            &outcome(),
        )
        .unwrap();

        store.save(&vault).unwrap();
        let loaded = store.load("My Vault").unwrap();
        assert_eq!(loaded.pub_key_ecdsa, vault.pub_key_ecdsa);
        assert_eq!(loaded.signers, vault.signers);

        let err = store.save(&vault).unwrap_err();
        assert!(matches!(err, Error::DuplicateVaultName(_)));

        // update replaces in place
        let mut rotated = vault.clone();
        rotated.hex_chain_code = "dd".into();
        store.update(&rotated).unwrap();
        assert_eq!(store.load("My Vault").unwrap().hex_chain_code, "dd");

        assert_eq!(store.list().unwrap(), vec!["My Vault"]);
    }
}
