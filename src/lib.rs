//! Issuing and managing TLS certificates from ACME (Automatic Certificate
//! Management Environment) providers such as [Let's Encrypt](https://letsencrypt.org/),
//! with DNS-01 validation and a local encrypted credential vault.
//!
//! All credential material (DNS API tokens, CA account keys, managed
//! certificate private keys) stays inside this process. Secrets are encrypted
//! at rest with a master key held in the OS credential manager; DNS provider
//! APIs are driven behind one adapter contract; the ACME protocol flow is
//! composed into a single issuance state machine.
//!
//! # Flow
//!
//! 1. [`Orchestrator::start_issuance`] validates the request, ensures a CA
//!    account, creates an order and places `_acme-challenge` TXT records
//!    through the adapter resolved for each domain.
//! 2. The caller applies any manual DNS instructions returned by step 1.
//! 3. [`Orchestrator::complete_issuance`] polls DNS propagation, answers the
//!    challenges, finalizes the order and downloads the certificate chain. The
//!    resulting [`CertificateRecord`] never contains private key bytes.
//!
//! # Staging for development
//!
//! Let's Encrypt enforces [rate limits] on the production directory. Configure
//! issuers against the staging directory while developing.
//!
//! [`Orchestrator::start_issuance`]: crate::issuance::Orchestrator::start_issuance
//! [`Orchestrator::complete_issuance`]: crate::issuance::Orchestrator::complete_issuance
//! [`CertificateRecord`]: crate::inventory::CertificateRecord
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod config;
mod error;
mod keys;
mod util;

pub mod acme;
pub mod dns;
pub mod inventory;
pub mod issuance;
pub mod vault;


pub use crate::{
    config::{DnsProviderConfig, Environment, IssuerConfig},
    error::{Error, ErrorCategory, Result},
    keys::KeyParams,
    vault::{SecretKind, SecretRef, SecretVault},
};
