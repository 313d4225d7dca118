//! Error taxonomy shared across the crate.
//!
//! Adapter- and transport-level failures are normalized into a fixed category
//! set before they reach the orchestrator; callers reason about
//! [`ErrorCategory`], never about raw provider messages.

use crate::{acme::api::Problem, dns::AdapterError, vault::VaultError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fixed category set surfaced across the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Auth,
    RateLimited,
    Network,
    NotFound,
    Timeout,
    VaultLocked,
    DecryptionFailed,
    CaRejection,
    Conflict,
    Unknown,
}

/// Crate-wide error type.
///
/// Every variant carries a human-readable reason. `Validation` errors are
/// raised before any network call and are always terminal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out waiting for TXT record on {domain}")]
    PropagationTimeout { domain: String },

    #[error("vault is locked: {0}")]
    VaultLocked(#[source] VaultError),

    #[error("secret is unrecoverable: {0}")]
    DecryptionFailed(String),

    #[error("CA rejected the request: {0}")]
    CaRejection(Problem),

    /// Cannot determine which issuer to revoke against.
    #[error("cannot determine issuer for certificate {0}")]
    NoIssuer(String),

    /// Neither the certificate key nor the issuer account key is resolvable.
    #[error("no usable key to authenticate revocation of certificate {0}")]
    NoUsableKey(String),

    #[error("certificate {0} is not managed by this store")]
    NotManaged(String),

    #[error("certificate {0} is already revoked")]
    AlreadyRevoked(String),

    /// A second `complete` call arrived while one was still in flight.
    #[error("request {0} already has an active task")]
    RequestBusy(String),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("vault error: {0}")]
    Vault(VaultError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation(reason.into())
    }

    /// The fixed category the caller reasons about.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) => ErrorCategory::Validation,
            Error::Auth(_) => ErrorCategory::Auth,
            Error::RateLimited(_) => ErrorCategory::RateLimited,
            Error::Network(_) => ErrorCategory::Network,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::PropagationTimeout { .. } => ErrorCategory::Timeout,
            Error::VaultLocked(_) => ErrorCategory::VaultLocked,
            Error::DecryptionFailed(_) => ErrorCategory::DecryptionFailed,
            Error::CaRejection(_) => ErrorCategory::CaRejection,
            Error::NoIssuer(_) | Error::NoUsableKey(_) | Error::NotManaged(_) => {
                ErrorCategory::Validation
            }
            Error::AlreadyRevoked(_) | Error::RequestBusy(_) => ErrorCategory::Conflict,
            Error::Adapter(err) => err.kind().into(),
            Error::Vault(err) => err.category(),
            Error::Other(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether the orchestrator may retry the failed step with backoff.
    ///
    /// Only transient transport conditions qualify. Validation, auth and CA
    /// rejections are terminal; a `DecryptionFailed` is fatal for its record.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::RateLimited
        )
    }
}

impl From<VaultError> for Error {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Locked(_) => Error::VaultLocked(err),
            VaultError::DecryptionFailed(reason) => Error::DecryptionFailed(reason),
            VaultError::NotFound(what) => Error::NotFound(what),
            other => Error::Vault(other),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Other(format!("JSON error: {err}"))
    }
}

impl From<Problem> for Error {
    fn from(problem: Problem) -> Self {
        if problem.is_rate_limited() {
            Error::RateLimited(problem.to_string())
        } else if problem.is_unauthorized() {
            Error::Auth(problem.to_string())
        } else if problem.is_already_revoked() {
            Error::AlreadyRevoked(problem.to_string())
        } else {
            Error::CaRejection(problem)
        }
    }
}
