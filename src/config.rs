//! Issuer and DNS provider configuration records.
//!
//! These are plain metadata rows owned by the inventory collaborator. Secret
//! material is referenced by [`SecretRef`], never embedded.

use serde::{Deserialize, Serialize};

use crate::vault::SecretRef;

/// Which class of directory an issuer points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// A test/staging directory. Issued certificates chain to an untrusted
    /// root and are not usable in production.
    Sandbox,
    Production,
}

/// A configured ACME issuer (certificate authority endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerConfig {
    pub issuer_id: String,
    pub directory_url: String,
    pub environment: Environment,

    /// Contact addresses registered with the CA, `mailto:` form.
    pub contact: Vec<String>,

    /// Vault reference to the account private key, once registered.
    pub account_key_ref: Option<SecretRef>,

    pub tos_agreed: bool,

    /// Whether this issuer is the currently selected default.
    pub selected: bool,
}

/// A configured DNS provider and the domain suffixes it serves.
///
/// A suffix is a plain (non-wildcard) name; `example.com` matches itself and
/// every subdomain. The resolver picks the provider with the longest matching
/// suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsProviderConfig {
    pub id: String,
    pub provider_type: crate::dns::ProviderType,
    pub label: String,
    pub domain_suffixes: Vec<String>,

    /// Vault reference to the provider API credential. `None` only for the
    /// manual provider type.
    pub credential_ref: Option<SecretRef>,
}
