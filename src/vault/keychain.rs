//! Master key custody in the OS credential manager.

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::vault::VaultError;

/// Fixed identifier the master key is filed under.
const SERVICE: &str = "certkeep";
const ACCOUNT: &str = "master-key";

/// Where the master key lives when the vault is locked.
///
/// The platform implementation may prompt for biometric or passcode
/// authentication on `load`; denial surfaces as
/// [`VaultError::AuthenticationDenied`], never as a silent retry.
pub trait KeychainStore: Send + Sync {
    /// Fetch the stored master key, or `None` if one was never created.
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError>;

    /// Persist a freshly generated master key.
    fn save(&self, key: &[u8]) -> Result<(), VaultError>;
}

/// [`KeychainStore`] backed by the platform credential manager (macOS
/// Keychain, Windows Credential Manager, Secret Service on Linux).
pub struct SystemKeychain {
    service: String,
    account: String,
}

impl SystemKeychain {
    pub fn new() -> Self {
        Self {
            service: SERVICE.to_owned(),
            account: ACCOUNT.to_owned(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, VaultError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|err| VaultError::KeyringUnavailable(err.to_string()))
    }
}

impl Default for SystemKeychain {
    fn default() -> Self {
        Self::new()
    }
}

impl KeychainStore for SystemKeychain {
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        match self.entry()?.get_secret() {
            Ok(key) => Ok(Some(Zeroizing::new(key))),
            Err(keyring::Error::NoEntry) => Ok(None),
            // user declined the platform prompt
            Err(keyring::Error::PlatformFailure(err)) => {
                Err(VaultError::AuthenticationDenied(err.to_string()))
            }
            Err(err) => Err(VaultError::KeyringUnavailable(err.to_string())),
        }
    }

    fn save(&self, key: &[u8]) -> Result<(), VaultError> {
        self.entry()?
            .set_secret(key)
            .map_err(|err| VaultError::KeyringUnavailable(err.to_string()))
    }
}

/// In-memory keychain for tests. Can be told to deny access, simulating a
/// declined biometric prompt or a missing platform backend.
pub struct MemoryKeychain {
    key: Mutex<Option<Vec<u8>>>,
    deny: std::sync::atomic::AtomicBool,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self {
            key: Mutex::new(None),
            deny: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make subsequent `load` calls fail with `AuthenticationDenied`.
    pub fn set_denied(&self, denied: bool) {
        self.deny.store(denied, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for MemoryKeychain {
    fn default() -> Self {
        Self::new()
    }
}

impl KeychainStore for MemoryKeychain {
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        if self.deny.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(VaultError::AuthenticationDenied(
                "authentication prompt declined".to_owned(),
            ));
        }
        Ok(self.key.lock().clone().map(Zeroizing::new))
    }

    fn save(&self, key: &[u8]) -> Result<(), VaultError> {
        *self.key.lock() = Some(key.to_vec());
        Ok(())
    }
}
