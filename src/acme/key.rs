//! ES256 signing keys for requests to the ACME API.
//!
//! Accounts use elliptic curve P-256: signed requests stay small and the
//! public key is derived from the private key, so only the private half needs
//! to live in the vault.

use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use zeroize::Zeroizing;

use crate::{Error, Result};

#[derive(Clone, Debug)]
pub(crate) struct AcmeKey {
    signing_key: p256::ecdsa::SigningKey,

    /// Set once the ACME API has told us the account URL.
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn generate() -> AcmeKey {
        Self::from_key(crate::keys::create_p256_key())
    }

    pub(crate) fn from_key(signing_key: p256::ecdsa::SigningKey) -> AcmeKey {
        AcmeKey {
            signing_key,
            key_id: None,
        }
    }

    /// Load from PKCS#8 DER, the form the vault stores.
    pub(crate) fn from_pkcs8_der(der: &[u8]) -> Result<AcmeKey> {
        let signing_key = ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_der(der)
            .map_err(|err| Error::Validation(format!("cannot read account key: {err}")))?;
        Ok(Self::from_key(signing_key))
    }

    pub(crate) fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let der = self
            .signing_key
            .to_pkcs8_der()
            .map_err(|err| Error::Other(format!("cannot encode account key: {err}")))?;
        Ok(Zeroizing::new(der.as_bytes().to_vec()))
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }

    pub(crate) fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_roundtrip() {
        let key = AcmeKey::generate();
        let der = key.to_pkcs8_der().unwrap();
        let restored = AcmeKey::from_pkcs8_der(&der).unwrap();
        assert_eq!(
            key.signing_key().verifying_key(),
            restored.signing_key().verifying_key()
        );
    }
}
