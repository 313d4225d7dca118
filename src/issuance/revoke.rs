//! Certificate revocation.
//!
//! Shorter flow than issuance: authenticate with the certificate's own key
//! when the vault still holds it, fall back to the issuer's account key, and
//! reject outright when neither is available. Four failure outcomes are kept
//! distinct: no issuer, no usable key, not managed, already revoked.

use crate::{
    acme::{AcmeClient, AcmeKey, DirectoryUrl},
    inventory::{CertificateRecord, CertificateSource},
    keys,
    Error, Result,
};

use super::Orchestrator;

/// Reasons for revocation, codes from [RFC 5280 §5.3.1].
///
/// [RFC 5280 §5.3.1]: https://tools.ietf.org/html/rfc5280#section-5.3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified = 0,
    KeyCompromise = 1,
    CACompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    // value 7 is not used
    RemoveFromCRL = 8,
    PrivilegeWithdrawn = 9,
    AACompromise = 10,
}

impl RevocationReason {
    fn code(self) -> Option<usize> {
        match self {
            // > the reason code CRL entry extension SHOULD be absent instead
            // > of using the unspecified (0) reasonCode value
            // see <https://datatracker.ietf.org/doc/html/rfc5280#section-5.3.1>
            RevocationReason::Unspecified => None,
            reason => Some(reason as usize),
        }
    }
}

impl Orchestrator {
    /// Revoke an issued certificate and record the revocation in the
    /// inventory.
    pub async fn revoke_certificate(
        &self,
        certificate_id: &str,
        reason: Option<RevocationReason>,
    ) -> Result<CertificateRecord> {
        let record = self
            .inventory
            .certificate(certificate_id)
            .ok_or_else(|| Error::NotFound(format!("certificate {certificate_id}")))?;

        if record.is_revoked() {
            return Err(Error::AlreadyRevoked(certificate_id.to_owned()));
        }

        if matches!(record.source, CertificateSource::Imported) {
            return Err(Error::NotManaged(certificate_id.to_owned()));
        }

        let issuer_id = record
            .issuer_id
            .as_deref()
            .ok_or_else(|| Error::NoIssuer(certificate_id.to_owned()))?;
        let issuer = self
            .inventory
            .issuer(issuer_id)
            .ok_or_else(|| Error::NoIssuer(certificate_id.to_owned()))?;

        let cert_der = keys::first_der_of_chain(&record.chain_pem)?;
        let reason_code = reason.and_then(RevocationReason::code);

        let client = AcmeClient::connect(DirectoryUrl::Other(&issuer.directory_url)).await?;

        // prefer the certificate's own key; it proves control without an
        // account round trip
        if let Some(cert_key) = self.load_key(record.key_ref.as_ref())? {
            client
                .revoke_with_cert_key(&cert_der, cert_key, reason_code)
                .await?;
        } else if let Some(account_key) = self.load_key(issuer.account_key_ref.as_ref())? {
            let account = client
                .ensure_account(account_key, &issuer.contact, issuer.tos_agreed)
                .await?;
            account.revoke_certificate(&cert_der, reason_code).await?;
        } else {
            return Err(Error::NoUsableKey(certificate_id.to_owned()));
        }

        let revoked_at = time::OffsetDateTime::now_utc().unix_timestamp();
        self.inventory
            .mark_revoked(certificate_id, reason_code, revoked_at);

        Ok(self
            .inventory
            .certificate(certificate_id)
            .unwrap_or(CertificateRecord {
                revoked_at: Some(revoked_at),
                revocation_reason: reason_code,
                ..record
            }))
    }

    /// Resolve a key reference to a signing key.
    ///
    /// A missing or deleted reference is "no key" and the caller falls back;
    /// a locked vault or an integrity failure propagates as itself rather
    /// than masquerading as an absent key.
    fn load_key(
        &self,
        secret_ref: Option<&crate::vault::SecretRef>,
    ) -> Result<Option<AcmeKey>> {
        let Some(secret_ref) = secret_ref else {
            return Ok(None);
        };
        match self.vault.resolve(secret_ref) {
            Ok(der) => Ok(Some(AcmeKey::from_pkcs8_der(&der)?)),
            Err(crate::vault::VaultError::NotFound(_)) => {
                log::warn!("Key reference {secret_ref} no longer resolves");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dns::{DnsChallengeEngine, PollSettings, SystemResolver},
        inventory::{Inventory, MemoryInventory},
        vault::{EncryptedSecretStore, MemoryKeychain, SecretKind, SecretVault},
        Environment, IssuerConfig,
    };
    use std::{sync::Arc, time::Duration};

    struct Harness {
        orchestrator: Orchestrator,
        vault: Arc<SecretVault>,
        inventory: Arc<MemoryInventory>,
        _server: crate::test::TestServer,
    }

    fn harness() -> Harness {
        let server = crate::test::with_directory_server();

        let vault = Arc::new(SecretVault::with_parts(
            Box::new(MemoryKeychain::new()),
            EncryptedSecretStore::in_memory(),
        ));

        let inventory = Arc::new(MemoryInventory::new());
        inventory.save_issuer(IssuerConfig {
            issuer_id: "staging".to_owned(),
            directory_url: server.dir_url.clone(),
            environment: Environment::Sandbox,
            contact: vec![],
            account_key_ref: None,
            tos_agreed: true,
            selected: true,
        });

        let engine = DnsChallengeEngine::new(
            Arc::new(SystemResolver::new()),
            PollSettings {
                interval: Duration::from_millis(5),
                budget: Duration::from_millis(40),
            },
        );

        let orchestrator = Orchestrator::new(
            Arc::clone(&vault),
            Arc::clone(&inventory) as Arc<dyn Inventory>,
            engine,
        )
        .with_acme_poll_delay(Duration::from_millis(1));

        Harness {
            orchestrator,
            vault,
            inventory,
            _server: server,
        }
    }

    fn record(id: &str, issuer_id: Option<&str>) -> CertificateRecord {
        CertificateRecord {
            id: id.to_owned(),
            subjects: vec!["a.example.com".to_owned()],
            issuer_id: issuer_id.map(str::to_owned),
            serial: "0abc".to_owned(),
            not_before: 1_700_000_000,
            not_after: 1_707_776_000,
            fingerprint_sha256: "00".repeat(32),
            source: CertificateSource::Managed,
            key_ref: None,
            chain_pem: crate::test::issued_chain_pem().to_owned(),
            renewed_from: None,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    fn store_account_key(h: &Harness) {
        let key = AcmeKey::generate();
        let der = key.to_pkcs8_der().unwrap();
        let secret_ref = h
            .vault
            .store(SecretKind::AccountKey, "staging account key", &der)
            .unwrap();

        let mut issuer = h.inventory.issuer("staging").unwrap();
        issuer.account_key_ref = Some(secret_ref);
        h.inventory.save_issuer(issuer);
    }

    #[tokio::test]
    async fn missing_issuer_cannot_be_determined() {
        let h = harness();
        h.inventory.save_certificate(record("cert-1", None));

        match h.orchestrator.revoke_certificate("cert-1", None).await {
            Err(Error::NoIssuer(id)) => assert_eq!(id, "cert-1"),
            other => panic!("expected NoIssuer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_revocation_reports_already_revoked() {
        let h = harness();
        store_account_key(&h);
        h.inventory
            .save_certificate(record("cert-1", Some("staging")));

        let revoked = h
            .orchestrator
            .revoke_certificate("cert-1", Some(RevocationReason::Superseded))
            .await
            .unwrap();
        assert!(revoked.is_revoked());
        assert_eq!(revoked.revocation_reason, Some(4));

        match h.orchestrator.revoke_certificate("cert-1", None).await {
            Err(Error::AlreadyRevoked(id)) => assert_eq!(id, "cert-1"),
            other => panic!("expected AlreadyRevoked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn imported_certificates_are_not_managed() {
        let h = harness();
        h.inventory.save_certificate(CertificateRecord {
            source: CertificateSource::Imported,
            ..record("cert-1", Some("staging"))
        });

        match h.orchestrator.revoke_certificate("cert-1", None).await {
            Err(Error::NotManaged(id)) => assert_eq!(id, "cert-1"),
            other => panic!("expected NotManaged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_key_anywhere_is_rejected() {
        let h = harness();
        // issuer has no account key and the record carries no key reference
        h.inventory
            .save_certificate(record("cert-1", Some("staging")));

        match h.orchestrator.revoke_certificate("cert-1", None).await {
            Err(Error::NoUsableKey(id)) => assert_eq!(id, "cert-1"),
            other => panic!("expected NoUsableKey, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn certificate_key_is_preferred() {
        let h = harness();

        let cert_key = AcmeKey::generate();
        let der = cert_key.to_pkcs8_der().unwrap();
        let key_ref = h
            .vault
            .store(SecretKind::ManagedPrivateKey, "cert key", &der)
            .unwrap();

        h.inventory.save_certificate(CertificateRecord {
            key_ref: Some(key_ref),
            ..record("cert-1", Some("staging"))
        });

        // no account key on file, yet revocation succeeds via the cert key
        let revoked = h
            .orchestrator
            .revoke_certificate("cert-1", Some(RevocationReason::Unspecified))
            .await
            .unwrap();
        assert!(revoked.is_revoked());
        // unspecified maps to an absent reason code
        assert_eq!(revoked.revocation_reason, None);
    }

    #[tokio::test]
    async fn unknown_certificate_is_not_found() {
        let h = harness();
        match h.orchestrator.revoke_certificate("cert-404", None).await {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
