//! Persistent store of encrypted secret rows.
//!
//! The store holds ciphertext and metadata only; encryption and decryption
//! happen in [`SecretVault`](crate::vault::SecretVault), which owns the master
//! key. Rows are persisted as one JSON document, rewritten atomically via a
//! temp file so a crash never leaves a partial record on disk. Writes are
//! serialized behind their own lock regardless of how many decrypt operations
//! run in parallel.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use base64::prelude::*;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::vault::{SecretKind, SecretRef, VaultError};

/// One encrypted secret at rest.
///
/// `blob` is `nonce || ciphertext || tag`: a 12-byte random nonce followed by
/// the AES-256-GCM output. The reference id is never reused, even after the
/// row is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRow {
    pub id: SecretRef,
    pub kind: SecretKind,
    pub label: String,
    #[serde(with = "blob_base64")]
    pub blob: Vec<u8>,
    /// Unix timestamp, seconds.
    pub created_at: i64,
}

/// Metadata-only view of a row, safe to hand across the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMeta {
    pub id: SecretRef,
    pub kind: SecretKind,
    pub label: String,
    pub created_at: i64,
}

impl From<&SecretRow> for SecretMeta {
    fn from(row: &SecretRow) -> Self {
        SecretMeta {
            id: row.id.clone(),
            kind: row.kind,
            label: row.label.clone(),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    secrets: BTreeMap<String, SecretRow>,
}

/// Serialized collection of [`SecretRow`]s, optionally file-backed.
pub struct EncryptedSecretStore {
    path: Option<PathBuf>,
    rows: RwLock<BTreeMap<String, SecretRow>>,
    /// Serializes document rewrites; independent of the read path.
    write_guard: Mutex<()>,
}

impl EncryptedSecretStore {
    /// Open (or create) a file-backed store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let path = path.as_ref().to_owned();
        let rows = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|err| VaultError::Storage(format!("read {}: {err}", path.display())))?;
            let doc: StoreDocument = serde_json::from_str(&raw)
                .map_err(|err| VaultError::Storage(format!("parse {}: {err}", path.display())))?;
            doc.secrets
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            rows: RwLock::new(rows),
            write_guard: Mutex::new(()),
        })
    }

    /// A store that lives only in memory. Used by tests and ephemeral setups.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rows: RwLock::new(BTreeMap::new()),
            write_guard: Mutex::new(()),
        }
    }

    pub fn insert(&self, row: SecretRow) -> Result<(), VaultError> {
        self.rows.write().insert(row.id.as_str().to_owned(), row);
        self.persist()
    }

    pub fn get(&self, id: &SecretRef) -> Option<SecretRow> {
        self.rows.read().get(id.as_str()).cloned()
    }

    /// Remove a row. The reference becomes permanently unresolvable.
    pub fn remove(&self, id: &SecretRef) -> Result<bool, VaultError> {
        let removed = self.rows.write().remove(id.as_str()).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Metadata for every row, optionally filtered by kind.
    pub fn list(&self, kind: Option<SecretKind>) -> Vec<SecretMeta> {
        self.rows
            .read()
            .values()
            .filter(|row| kind.map_or(true, |k| row.kind == k))
            .map(SecretMeta::from)
            .collect()
    }

    fn persist(&self) -> Result<(), VaultError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _write = self.write_guard.lock();

        let doc = StoreDocument {
            secrets: self.rows.read().clone(),
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|err| VaultError::Storage(format!("serialize store: {err}")))?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .map_err(|err| VaultError::Storage(format!("write {}: {err}", tmp.display())))?;
        fs::rename(&tmp, path)
            .map_err(|err| VaultError::Storage(format!("rename {}: {err}", path.display())))
    }
}

mod blob_base64 {
    use super::*;
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(blob: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(blob))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, label: &str) -> SecretRow {
        SecretRow {
            id: SecretRef::from_raw(id),
            kind: SecretKind::ProviderCredential,
            label: label.to_owned(),
            blob: vec![1, 2, 3, 4],
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let store = EncryptedSecretStore::open(&path).unwrap();
        store.insert(row("sec-a", "cloudflare token")).unwrap();

        let reopened = EncryptedSecretStore::open(&path).unwrap();
        let got = reopened.get(&SecretRef::from_raw("sec-a")).unwrap();
        assert_eq!(got.label, "cloudflare token");
        assert_eq!(got.blob, vec![1, 2, 3, 4]);
    }

    #[test]
    fn removed_rows_stay_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let store = EncryptedSecretStore::open(&path).unwrap();
        store.insert(row("sec-a", "token")).unwrap();
        assert!(store.remove(&SecretRef::from_raw("sec-a")).unwrap());

        let reopened = EncryptedSecretStore::open(&path).unwrap();
        assert!(reopened.get(&SecretRef::from_raw("sec-a")).is_none());
    }

    #[test]
    fn list_filters_by_kind() {
        let store = EncryptedSecretStore::in_memory();
        store.insert(row("sec-a", "token")).unwrap();
        store
            .insert(SecretRow {
                kind: SecretKind::AccountKey,
                ..row("sec-b", "account key")
            })
            .unwrap();

        assert_eq!(store.list(None).len(), 2);
        let keys = store.list(Some(SecretKind::AccountKey));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id.as_str(), "sec-b");
    }
}
