//! Encrypted secret vault.
//!
//! The vault owns the master encryption key and is the only component that
//! ever sees secret plaintext. Everything else holds a [`SecretRef`] and asks
//! the vault to resolve it at the moment of use.
//!
//! The master key is a 256-bit random value filed in the OS credential
//! manager. While the vault is unlocked a single cached copy lives in process
//! memory behind a read-write lock; `lock()` zeroizes it. Secrets are
//! encrypted with AES-256-GCM under a fresh 96-bit nonce per operation and
//! stored as `nonce || ciphertext || tag`. A tag that fails to verify is
//! treated as tampering or corruption: fatal for that record, never
//! retried.

use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use parking_lot::RwLock;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

mod keychain;
mod store;

pub use self::{
    keychain::{KeychainStore, MemoryKeychain, SystemKeychain},
    store::{EncryptedSecretStore, SecretMeta, SecretRow},
};

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// GCM appends a 16-byte authentication tag to the ciphertext.
const TAG_LEN: usize = 16;

/// Vault failure modes.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("OS credential manager unavailable: {0}")]
    KeyringUnavailable(String),

    #[error("authentication denied: {0}")]
    AuthenticationDenied(String),

    #[error("secret not found: {0}")]
    NotFound(String),

    /// Ciphertext integrity failure. Indicates tampering or corruption of the
    /// one record, not a transient fault; never retried.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The vault is locked and auto-unlock failed or was denied.
    #[error("vault locked ({0})")]
    Locked(String),

    #[error("secret store error: {0}")]
    Storage(String),
}

impl VaultError {
    pub(crate) fn category(&self) -> crate::ErrorCategory {
        match self {
            VaultError::KeyringUnavailable(_) | VaultError::AuthenticationDenied(_) => {
                crate::ErrorCategory::Auth
            }
            VaultError::NotFound(_) => crate::ErrorCategory::NotFound,
            VaultError::DecryptionFailed(_) => crate::ErrorCategory::DecryptionFailed,
            VaultError::Locked(_) => crate::ErrorCategory::VaultLocked,
            VaultError::Storage(_) => crate::ErrorCategory::Unknown,
        }
    }
}

/// What a stored secret is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretKind {
    AccountKey,
    ManagedPrivateKey,
    ProviderCredential,
}

/// Stable, opaque reference to a stored secret.
///
/// The prefix marks it as a reference in logs and config files; the suffix is
/// random, so ids are never reused even after deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    fn generate() -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        SecretRef(format!("sec-{}", crate::util::base64url(&raw)))
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        SecretRef(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The in-memory master key. At most one live copy exists; wrapped in
/// `Zeroizing` so the bytes are wiped on lock and on process exit.
struct MasterKey(Zeroizing<[u8; MASTER_KEY_LEN]>);

/// Owns the master key and the encrypted secret store.
pub struct SecretVault {
    keychain: Box<dyn KeychainStore>,
    store: EncryptedSecretStore,
    /// Single-writer, many-reader: status checks and crypto take read locks,
    /// lock/unlock take the write lock and establish the unique owner of the
    /// key material.
    master: RwLock<Option<MasterKey>>,
}

impl SecretVault {
    /// Vault over a file-backed store and the platform credential manager.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        Ok(Self::with_parts(
            Box::new(SystemKeychain::new()),
            EncryptedSecretStore::open(path)?,
        ))
    }

    /// Vault over explicit parts. Tests inject a [`MemoryKeychain`] and an
    /// in-memory store here.
    pub fn with_parts(keychain: Box<dyn KeychainStore>, store: EncryptedSecretStore) -> Self {
        Self {
            keychain,
            store,
            master: RwLock::new(None),
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.master.read().is_some()
    }

    /// Fetch the master key from the OS credential manager, generating and
    /// filing one on first use. May block on a platform authentication
    /// prompt; denial returns a typed error rather than retrying.
    pub fn unlock(&self) -> Result<(), VaultError> {
        let mut master = self.master.write();
        if master.is_some() {
            return Ok(());
        }

        let key = match self.keychain.load()? {
            Some(existing) => {
                if existing.len() != MASTER_KEY_LEN {
                    return Err(VaultError::DecryptionFailed(
                        "stored master key has wrong length".to_owned(),
                    ));
                }
                let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
                key.copy_from_slice(&existing);
                key
            }
            None => {
                log::info!("No master key on file; generating one");
                let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
                rand::thread_rng().fill_bytes(key.as_mut());
                self.keychain.save(key.as_ref())?;
                key
            }
        };

        *master = Some(MasterKey(key));
        Ok(())
    }

    /// Zeroize the cached master key. Stored ciphertext is untouched.
    pub fn lock(&self) {
        *self.master.write() = None;
        log::debug!("Vault locked");
    }

    /// Encrypt and file a new secret, returning its reference.
    pub fn store(
        &self,
        kind: SecretKind,
        label: &str,
        plaintext: &[u8],
    ) -> Result<SecretRef, VaultError> {
        self.auto_unlock()?;

        let master = self.master.read();
        // a concurrent lock() may have beaten us here
        let key = &master
            .as_ref()
            .ok_or_else(|| VaultError::Locked("locked concurrently".to_owned()))?
            .0;

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|_| VaultError::DecryptionFailed("invalid master key".to_owned()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| VaultError::Storage("encryption failure".to_owned()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        let id = SecretRef::generate();
        self.store.insert(SecretRow {
            id: id.clone(),
            kind,
            label: label.to_owned(),
            blob,
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        })?;

        Ok(id)
    }

    /// Decrypt a stored secret.
    ///
    /// Auto-unlocks when locked; an unlock denial comes back as
    /// [`VaultError::Locked`] carrying the underlying reason. Decryption
    /// fails closed: a tag mismatch returns an error, never partial
    /// plaintext.
    pub fn resolve(&self, id: &SecretRef) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.auto_unlock()?;

        let row = self
            .store
            .get(id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;

        if row.blob.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::DecryptionFailed(format!(
                "record {id} is truncated"
            )));
        }

        let master = self.master.read();
        let key = &master
            .as_ref()
            .ok_or_else(|| VaultError::Locked("locked concurrently".to_owned()))?
            .0;

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|_| VaultError::DecryptionFailed("invalid master key".to_owned()))?;

        let (nonce, ciphertext) = row.blob.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                VaultError::DecryptionFailed(format!("authentication tag mismatch for {id}"))
            })?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Remove a secret. The reference becomes permanently unresolvable.
    pub fn delete(&self, id: &SecretRef) -> Result<(), VaultError> {
        if !self.store.remove(id)? {
            return Err(VaultError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Metadata-only listing for the CRUD boundary; never plaintext.
    pub fn list(&self, kind: Option<SecretKind>) -> Vec<SecretMeta> {
        self.store.list(kind)
    }

    fn auto_unlock(&self) -> Result<(), VaultError> {
        if self.is_unlocked() {
            return Ok(());
        }
        self.unlock().map_err(|err| match err {
            err @ VaultError::DecryptionFailed(_) => err,
            other => VaultError::Locked(other.to_string()),
        })
    }
}
