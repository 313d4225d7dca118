//! TXT lookups used for propagation verification.
//!
//! The engine never trusts a provider's write acknowledgement; it watches the
//! record appear through an actual resolver. The trait seam lets tests script
//! observations without the network.

use async_trait::async_trait;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    proto::op::ResponseCode,
    TokioAsyncResolver,
};

use crate::dns::normalize_txt;

/// Classification of a single propagation probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxtObservation {
    /// The expected value is visible.
    Found,
    /// The name resolves but carries no TXT data yet.
    Pending,
    /// The name does not exist.
    NxDomain,
    /// TXT data exists but none of it matches the expected value.
    WrongContent,
    /// The probe itself failed.
    Error(String),
}

#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// Query TXT records at `name` and classify against `expected`.
    async fn observe(&self, name: &str, expected: &str) -> TxtObservation;
}

/// [`TxtLookup`] over the system's configured resolver.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let mut opts = ResolverOpts::default();
        // a cached empty answer would stall the whole propagation poll
        opts.cache_size = 0;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtLookup for SystemResolver {
    async fn observe(&self, name: &str, expected: &str) -> TxtObservation {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => {
                let mut saw_any = false;
                for record in lookup.iter() {
                    saw_any = true;
                    let value: String = record
                        .txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect();
                    if normalize_txt(&value) == expected {
                        return TxtObservation::Found;
                    }
                }
                if saw_any {
                    TxtObservation::WrongContent
                } else {
                    TxtObservation::Pending
                }
            }
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                    if *response_code == ResponseCode::NXDomain {
                        TxtObservation::NxDomain
                    } else {
                        TxtObservation::Pending
                    }
                }
                _ => TxtObservation::Error(err.to_string()),
            },
        }
    }
}
