//! Boundary to the non-secret certificate inventory.
//!
//! The inventory owns issuer and provider configuration plus certificate
//! metadata. It never sees key material; certificates reference their private
//! keys by [`SecretRef`]. The orchestrator reads configuration from here and
//! writes finalized or revoked [`CertificateRecord`]s back.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    config::{DnsProviderConfig, IssuerConfig},
    vault::SecretRef,
};

/// Where a certificate's key material came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateSource {
    /// Key generated internally and held in the vault.
    Managed,
    /// Issued from an externally authored CSR; we never saw the key.
    ExternalCsr,
    /// Imported from elsewhere; not issued through this store and therefore
    /// not revocable through it.
    Imported,
}

/// Certificate metadata DTO handed across the API boundary.
///
/// Never contains private key bytes; `key_ref` points into the vault when the
/// key is managed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: String,

    /// CN plus SANs, deduplicated.
    pub subjects: Vec<String>,

    pub issuer_id: Option<String>,
    pub serial: String,

    /// Unix timestamps, seconds.
    pub not_before: i64,
    pub not_after: i64,

    pub fingerprint_sha256: String,
    pub source: CertificateSource,
    pub key_ref: Option<SecretRef>,

    /// Issued chain as PEM. Public material; the private key never appears
    /// here.
    pub chain_pem: String,

    /// Id of the certificate this one renewed, resolved by lookup here;
    /// plain reference, not an embedded record.
    pub renewed_from: Option<String>,

    /// Unix timestamp of revocation, if revoked.
    pub revoked_at: Option<i64>,
    pub revocation_reason: Option<usize>,
}

impl CertificateRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// The external inventory collaborator's contract.
pub trait Inventory: Send + Sync {
    fn issuer(&self, issuer_id: &str) -> Option<IssuerConfig>;
    fn save_issuer(&self, issuer: IssuerConfig);
    fn delete_issuer(&self, issuer_id: &str) -> Option<IssuerConfig>;
    fn issuers(&self) -> Vec<IssuerConfig>;

    fn providers(&self) -> Vec<DnsProviderConfig>;
    fn save_provider(&self, provider: DnsProviderConfig);
    fn delete_provider(&self, provider_id: &str) -> Option<DnsProviderConfig>;

    fn certificate(&self, certificate_id: &str) -> Option<CertificateRecord>;
    fn save_certificate(&self, record: CertificateRecord);

    /// Record revocation metadata on an existing certificate.
    fn mark_revoked(&self, certificate_id: &str, reason: Option<usize>, revoked_at: i64);
}

/// In-memory inventory; the default store for tests and embedders that keep
/// their own persistence.
#[derive(Default)]
pub struct MemoryInventory {
    issuers: RwLock<HashMap<String, IssuerConfig>>,
    providers: RwLock<HashMap<String, DnsProviderConfig>>,
    certificates: RwLock<HashMap<String, CertificateRecord>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inventory for MemoryInventory {
    fn issuer(&self, issuer_id: &str) -> Option<IssuerConfig> {
        self.issuers.read().get(issuer_id).cloned()
    }

    fn save_issuer(&self, issuer: IssuerConfig) {
        self.issuers
            .write()
            .insert(issuer.issuer_id.clone(), issuer);
    }

    fn delete_issuer(&self, issuer_id: &str) -> Option<IssuerConfig> {
        self.issuers.write().remove(issuer_id)
    }

    fn issuers(&self) -> Vec<IssuerConfig> {
        self.issuers.read().values().cloned().collect()
    }

    fn providers(&self) -> Vec<DnsProviderConfig> {
        self.providers.read().values().cloned().collect()
    }

    fn save_provider(&self, provider: DnsProviderConfig) {
        self.providers.write().insert(provider.id.clone(), provider);
    }

    fn delete_provider(&self, provider_id: &str) -> Option<DnsProviderConfig> {
        self.providers.write().remove(provider_id)
    }

    fn certificate(&self, certificate_id: &str) -> Option<CertificateRecord> {
        self.certificates.read().get(certificate_id).cloned()
    }

    fn save_certificate(&self, record: CertificateRecord) {
        self.certificates.write().insert(record.id.clone(), record);
    }

    fn mark_revoked(&self, certificate_id: &str, reason: Option<usize>, revoked_at: i64) {
        if let Some(record) = self.certificates.write().get_mut(certificate_id) {
            record.revoked_at = Some(revoked_at);
            record.revocation_reason = reason;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> CertificateRecord {
        CertificateRecord {
            id: id.to_owned(),
            subjects: vec!["a.example.com".to_owned()],
            issuer_id: Some("issuer-1".to_owned()),
            serial: "0abc".to_owned(),
            not_before: 1_700_000_000,
            not_after: 1_707_776_000,
            fingerprint_sha256: "00".repeat(32),
            source: CertificateSource::Managed,
            key_ref: None,
            chain_pem: String::new(),
            renewed_from: None,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    #[test]
    fn mark_revoked_sets_metadata() {
        let inventory = MemoryInventory::new();
        inventory.save_certificate(record("cert-1"));

        inventory.mark_revoked("cert-1", Some(4), 1_701_000_000);

        let got = inventory.certificate("cert-1").unwrap();
        assert!(got.is_revoked());
        assert_eq!(got.revocation_reason, Some(4));
    }

    #[test]
    fn renewed_from_resolves_by_lookup() {
        let inventory = MemoryInventory::new();
        inventory.save_certificate(record("cert-1"));
        inventory.save_certificate(CertificateRecord {
            renewed_from: Some("cert-1".to_owned()),
            ..record("cert-2")
        });

        let renewed = inventory.certificate("cert-2").unwrap();
        let parent = inventory
            .certificate(renewed.renewed_from.as_deref().unwrap())
            .unwrap();
        assert_eq!(parent.id, "cert-1");
    }
}
