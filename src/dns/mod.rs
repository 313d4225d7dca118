//! DNS adapters and challenge plumbing.
//!
//! Every configured DNS provider sits behind the one [`DnsAdapter`] contract:
//! present a TXT record, clean it up, test the credentials. Provider errors
//! are normalized into the fixed [`AdapterErrorKind`] set before they leave
//! this module; the orchestrator never sees raw provider messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

mod cloudflare;
mod desec;
mod engine;
mod lookup;
mod resolver;

pub use self::{
    cloudflare::CloudflareAdapter,
    desec::DesecAdapter,
    engine::{ChallengeTask, DnsChallengeEngine, PollSettings},
    lookup::{SystemResolver, TxtLookup, TxtObservation},
    resolver::{ProviderResolver, Resolution},
};

use crate::{config::DnsProviderConfig, Error};

/// Normalized adapter failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    Auth,
    RateLimited,
    Network,
    NotFound,
    Unknown,
}

impl From<AdapterErrorKind> for crate::ErrorCategory {
    fn from(kind: AdapterErrorKind) -> Self {
        match kind {
            AdapterErrorKind::Auth => crate::ErrorCategory::Auth,
            AdapterErrorKind::RateLimited => crate::ErrorCategory::RateLimited,
            AdapterErrorKind::Network => crate::ErrorCategory::Network,
            AdapterErrorKind::NotFound => crate::ErrorCategory::NotFound,
            AdapterErrorKind::Unknown => crate::ErrorCategory::Unknown,
        }
    }
}

/// A provider failure, already normalized.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AdapterError {
    kind: AdapterErrorKind,
    message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Auth, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::NotFound, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Unknown, message)
    }

    /// Map an HTTP status from a provider API onto the fixed category set.
    pub fn from_status(status: reqwest::StatusCode, message: impl Into<String>) -> Self {
        let kind = match status.as_u16() {
            401 | 403 => AdapterErrorKind::Auth,
            404 => AdapterErrorKind::NotFound,
            429 => AdapterErrorKind::RateLimited,
            _ => AdapterErrorKind::Unknown,
        };
        Self::new(kind, message)
    }

    pub fn kind(&self) -> AdapterErrorKind {
        self.kind
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(AdapterErrorKind::Network, err.to_string())
    }
}

/// Result of a connection test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub detail: String,
}

/// One DNS provider behind the common contract.
///
/// `present_txt` is an upsert: a record that already exists under the name is
/// updated, never duplicated. Automated implementations verify every write by
/// reading the record back through the provider's own API before reporting
/// success.
#[async_trait]
pub trait DnsAdapter: Send + Sync {
    /// Stable id of the backing provider configuration.
    fn id(&self) -> &str;

    async fn present_txt(&self, name: &str, value: &str) -> Result<(), AdapterError>;

    async fn cleanup_txt(&self, name: &str, value: &str) -> Result<(), AdapterError>;

    async fn test_connection(&self) -> Result<TestOutcome, AdapterError>;

    /// Whether a human has to apply the record out of band.
    fn is_manual(&self) -> bool {
        false
    }
}

/// Configured provider kinds. Adapter selection goes through this enum, one
/// concrete implementation per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Manual,
    Cloudflare,
    Desec,
}

impl ProviderType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::Manual => "manual",
            ProviderType::Cloudflare => "cloudflare",
            ProviderType::Desec => "desec",
        }
    }

    /// Whether adapters of this type need an API credential from the vault.
    pub fn requires_credential(self) -> bool {
        !matches!(self, ProviderType::Manual)
    }
}

/// Instruction handed to the caller when a record must be applied by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsInstruction {
    pub adapter: String,
    pub record_name: String,
    pub value: String,
    /// The zone the record belongs in, best effort (parent of the
    /// `_acme-challenge` label).
    pub zone: String,
}

/// The fallback adapter used when no configured provider matches a domain.
///
/// Performs no network calls; the record name and value surface to the caller
/// as a [`DnsInstruction`] and the propagation recheck is caller-driven.
pub struct ManualAdapter {
    id: String,
}

impl ManualAdapter {
    pub fn new() -> Self {
        Self {
            id: "manual".to_owned(),
        }
    }
}

impl Default for ManualAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsAdapter for ManualAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn present_txt(&self, name: &str, value: &str) -> Result<(), AdapterError> {
        log::info!("Manual DNS step: create TXT {name} = {value}");
        Ok(())
    }

    async fn cleanup_txt(&self, name: &str, _value: &str) -> Result<(), AdapterError> {
        log::info!("Manual DNS step: the TXT record {name} can be removed");
        Ok(())
    }

    async fn test_connection(&self) -> Result<TestOutcome, AdapterError> {
        Ok(TestOutcome {
            detail: "manual adapter performs no network calls".to_owned(),
        })
    }

    fn is_manual(&self) -> bool {
        true
    }
}

/// Build the adapter for a provider configuration. The credential is the
/// vault-resolved plaintext for the provider's `credential_ref`.
pub fn build_adapter(
    config: &DnsProviderConfig,
    credential: Option<Zeroizing<Vec<u8>>>,
) -> Result<Box<dyn DnsAdapter>, Error> {
    let token = |credential: Option<Zeroizing<Vec<u8>>>| -> Result<String, Error> {
        let bytes = credential.ok_or_else(|| {
            Error::validation(format!("provider {} has no credential", config.id))
        })?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::validation(format!("provider {} credential is not UTF-8", config.id)))
    };

    Ok(match config.provider_type {
        ProviderType::Manual => Box::new(ManualAdapter::new()),
        ProviderType::Cloudflare => Box::new(CloudflareAdapter::new(&config.id, token(credential)?)),
        ProviderType::Desec => Box::new(DesecAdapter::new(&config.id, token(credential)?)),
    })
}

/// Record name for a DNS-01 authorization.
pub(crate) fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{domain}")
}

/// TXT values come back from provider APIs with varying quoting; strip one
/// layer of surrounding double quotes before comparing.
pub(crate) fn normalize_txt(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(trimmed)
}
