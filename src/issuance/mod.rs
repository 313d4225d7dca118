//! Issuance orchestration.
//!
//! Composes the vault, the DNS challenge engine and the ACME client into one
//! state machine per request:
//!
//! ```text
//! AccountEnsure -> OrderCreate -> AuthorizationFetch -> ChallengeSelection
//!   -> ChallengePresented -> PropagationPoll -> ChallengeRespond
//!   -> AuthorizationValidated -> Finalize -> CertificateDownload -> Persisted
//! ```
//!
//! [`Orchestrator::start_issuance`] runs up to `ChallengePresented` and
//! always pauses there, so manual DNS intervention and automated providers
//! share one shape. [`Orchestrator::complete_issuance`] is the explicit
//! continuation signal that drives the rest; the machine never advances past
//! the gate on its own. Each request id has at most one active task; a second
//! `complete` call while one is in flight is rejected, not double-executed.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    acme::{AcmeAccount, AcmeClient, AcmeKey, AcmeOrder, DirectoryUrl},
    config::IssuerConfig,
    dns::{
        build_adapter, challenge_record_name, ChallengeTask, DnsAdapter, DnsChallengeEngine,
        DnsInstruction, ManualAdapter, ProviderResolver,
    },
    inventory::{CertificateRecord, CertificateSource, Inventory},
    keys::{self, KeyParams},
    util::new_id,
    vault::{SecretKind, SecretVault},
    Error, Result,
};

mod admin;
mod revoke;

pub use self::revoke::RevocationReason;

/// Automatic retries of a transient (network, rate-limit) CA failure before
/// the error surfaces to the caller.
const MAX_TRANSIENT_RETRIES: u32 = 3;

/// Where the certificate key comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Generate internally; the key goes straight into the vault and never
    /// leaves the core.
    Generate(KeyParams),

    /// Externally authored CSR. The CSR's own SAN set is authoritative.
    ExternalCsr { csr_pem: String },
}

/// Inbound issuance request.
#[derive(Debug, Clone)]
pub struct StartIssuance {
    pub domains: Vec<String>,
    pub issuer_id: String,
    pub key_source: KeySource,
    pub profile: Option<String>,
}

/// Progress of one request, observable through [`Orchestrator::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuancePhase {
    AccountEnsure,
    OrderCreate,
    AuthorizationFetch,
    ChallengeSelection,
    ChallengePresented,
    PropagationPoll,
    ChallengeRespond,
    AuthorizationValidated,
    Finalize,
    CertificateDownload,
    Persisted,
    Failed,
}

/// What `start_issuance` hands back: the request id to continue with, plus
/// any records a human must create.
#[derive(Debug, Clone)]
pub struct IssuanceStarted {
    pub request_id: String,
    pub instructions: Vec<DnsInstruction>,

    /// Domains whose provider resolution tied between two configured
    /// providers; issuance proceeded with the deterministic pick.
    pub ambiguous_domains: Vec<String>,
}

#[derive(Debug)]
enum PreparedKey {
    Generated(p256::ecdsa::SigningKey),
    External { csr_der: Vec<u8> },
}

/// A request paused at the `ChallengePresented` gate.
struct PendingIssuance {
    request: StartIssuance,
    /// Effective domain set; for the CSR path this is the CSR's SAN set.
    domains: Vec<String>,
    account: AcmeAccount,
    order: AcmeOrder,
    /// (challenge url, authorization url) per domain needing validation.
    challenges: Vec<(String, String)>,
    tasks: Vec<ChallengeTask>,
    key: PreparedKey,
}

/// Top-level entry point for issuance and revocation.
pub struct Orchestrator {
    vault: Arc<SecretVault>,
    inventory: Arc<dyn Inventory>,
    engine: DnsChallengeEngine,
    /// Delay between ACME status polls (authorization, finalize).
    acme_poll_delay: Duration,

    /// Request ids with a live orchestration task.
    active: Mutex<HashSet<String>>,
    /// Requests paused at the manual-confirmation gate.
    pending: Mutex<HashMap<String, PendingIssuance>>,
    progress: Mutex<HashMap<String, watch::Sender<IssuancePhase>>>,
}

/// Releases the per-request single-flight slot on drop.
struct ActiveGuard<'a> {
    orchestrator: &'a Orchestrator,
    request_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.active.lock().remove(&self.request_id);
    }
}

impl Orchestrator {
    pub fn new(
        vault: Arc<SecretVault>,
        inventory: Arc<dyn Inventory>,
        engine: DnsChallengeEngine,
    ) -> Self {
        Self {
            vault,
            inventory,
            engine,
            acme_poll_delay: Duration::from_secs(2),
            active: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
        }
    }

    /// Override the delay between ACME status polls.
    pub fn with_acme_poll_delay(mut self, delay: Duration) -> Self {
        self.acme_poll_delay = delay;
        self
    }

    /// Watch a request's phase transitions.
    pub fn subscribe(&self, request_id: &str) -> Option<watch::Receiver<IssuancePhase>> {
        self.progress
            .lock()
            .get(request_id)
            .map(|tx| tx.subscribe())
    }

    fn set_phase(&self, request_id: &str, phase: IssuancePhase) {
        if let Some(tx) = self.progress.lock().get(request_id) {
            let _ = tx.send(phase);
        }
        log::debug!("{request_id}: {phase:?}");
    }

    fn claim(&self, request_id: &str) -> Result<ActiveGuard<'_>> {
        if !self.active.lock().insert(request_id.to_owned()) {
            return Err(Error::RequestBusy(request_id.to_owned()));
        }
        Ok(ActiveGuard {
            orchestrator: self,
            request_id: request_id.to_owned(),
        })
    }

    /// Validate the request, ensure the CA account, create the order and
    /// place the DNS-01 records, then pause at `ChallengePresented`.
    ///
    /// Returns the instructions for any domain that resolved to the manual
    /// adapter. Nothing advances until [`complete_issuance`] is called.
    ///
    /// [`complete_issuance`]: Orchestrator::complete_issuance
    pub async fn start_issuance(&self, request: StartIssuance) -> Result<IssuanceStarted> {
        // everything here is checked before any DNS record is created or any
        // CA order is placed
        let (domains, key) = validate_request(&request)?;

        let issuer = self
            .inventory
            .issuer(&request.issuer_id)
            .ok_or_else(|| Error::NotFound(format!("issuer {}", request.issuer_id)))?;

        let request_id = new_id("req");
        let (tx, _rx) = watch::channel(IssuancePhase::AccountEnsure);
        self.progress.lock().insert(request_id.clone(), tx);
        let _guard = self.claim(&request_id)?;

        match self
            .run_start(&request_id, request, issuer, domains, key)
            .await
        {
            Ok(started) => Ok(started),
            Err(err) => {
                self.set_phase(&request_id, IssuancePhase::Failed);
                self.progress.lock().remove(&request_id);
                Err(err)
            }
        }
    }

    async fn run_start(
        &self,
        request_id: &str,
        request: StartIssuance,
        issuer: IssuerConfig,
        domains: Vec<String>,
        key: PreparedKey,
    ) -> Result<IssuanceStarted> {
        let client = AcmeClient::connect(DirectoryUrl::Other(&issuer.directory_url)).await?;

        // profiles are validated against the advertised set before the order
        // exists; an unknown profile never reaches the CA
        if let Some(profile) = &request.profile {
            let advertised = client.profiles();
            if !advertised.is_some_and(|profiles| profiles.contains_key(profile)) {
                return Err(Error::Validation(format!(
                    "issuer {} does not advertise profile {profile}",
                    issuer.issuer_id
                )));
            }
        }

        self.set_phase(request_id, IssuancePhase::AccountEnsure);
        let account = self.ensure_account(&client, issuer.clone()).await?;

        self.set_phase(request_id, IssuancePhase::OrderCreate);
        let order = account
            .new_order(&domains, request.profile.as_deref())
            .await?;

        self.set_phase(request_id, IssuancePhase::AuthorizationFetch);
        let authorizations = account.authorizations(&order).await?;

        self.set_phase(request_id, IssuancePhase::ChallengeSelection);
        let resolver = ProviderResolver::new(self.inventory.providers());

        let mut tasks = Vec::new();
        let mut challenges = Vec::new();
        let mut instructions = Vec::new();
        let mut ambiguous_domains = Vec::new();

        for (auth_url, auth) in &authorizations {
            if matches!(auth.status, crate::acme::api::AuthorizationStatus::Valid) {
                // ownership proven in a recent order; nothing to do
                continue;
            }

            let domain = auth.identifier.value.clone();
            let challenge = auth.dns_challenge().ok_or_else(|| {
                Error::Validation(format!("CA offers no dns-01 challenge for {domain}"))
            })?;

            let record_name = challenge_record_name(&domain);
            let expected_value = account.dns_proof(challenge)?;

            let resolution = resolver.resolve(&domain);
            if resolution.ambiguous {
                ambiguous_domains.push(domain.clone());
            }

            let adapter: Arc<dyn DnsAdapter> = match &resolution.provider {
                Some(config) => {
                    let credential = match &config.credential_ref {
                        Some(secret_ref) => Some(self.vault.resolve(secret_ref)?),
                        None => None,
                    };
                    Arc::from(build_adapter(config, credential)?)
                }
                None => Arc::new(ManualAdapter::new()),
            };

            if adapter.is_manual() {
                instructions.push(DnsInstruction {
                    adapter: adapter.id().to_owned(),
                    record_name: record_name.clone(),
                    value: expected_value.clone(),
                    zone: domain.clone(),
                });
            }

            challenges.push((challenge.url.clone(), auth_url.clone()));
            tasks.push(ChallengeTask {
                domain,
                record_name,
                expected_value,
                adapter,
            });
        }

        self.set_phase(request_id, IssuancePhase::ChallengePresented);
        if let Err(err) = self.engine.place(&tasks).await {
            self.engine.cleanup(&tasks).await;
            return Err(err);
        }

        self.pending.lock().insert(
            request_id.to_owned(),
            PendingIssuance {
                request,
                domains,
                account,
                order,
                challenges,
                tasks,
                key,
            },
        );

        Ok(IssuanceStarted {
            request_id: request_id.to_owned(),
            instructions,
            ambiguous_domains,
        })
    }

    /// Continuation signal: poll propagation, answer the challenges, finalize
    /// and persist.
    ///
    /// A propagation timeout leaves the request paused so the caller can try
    /// again once records are visible; terminal failures drop it.
    pub async fn complete_issuance(&self, request_id: &str) -> Result<CertificateRecord> {
        let _guard = self.claim(request_id)?;

        let pending = self
            .pending
            .lock()
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(format!("no paused request {request_id}")))?;

        match self.run_complete(request_id, &pending).await {
            Ok(record) => {
                // records served their purpose; best-effort removal
                self.engine.cleanup(&pending.tasks).await;
                self.set_phase(request_id, IssuancePhase::Persisted);
                self.progress.lock().remove(request_id);
                Ok(record)
            }
            Err(err) => {
                let resumable =
                    matches!(err, Error::PropagationTimeout { .. }) || err.is_retryable();
                if resumable {
                    // keep the records in place for the next attempt
                    self.pending.lock().insert(request_id.to_owned(), pending);
                    self.set_phase(request_id, IssuancePhase::ChallengePresented);
                } else {
                    self.engine.cleanup(&pending.tasks).await;
                    self.set_phase(request_id, IssuancePhase::Failed);
                    self.progress.lock().remove(request_id);
                }
                Err(err)
            }
        }
    }

    async fn run_complete(
        &self,
        request_id: &str,
        pending: &PendingIssuance,
    ) -> Result<CertificateRecord> {
        self.set_phase(request_id, IssuancePhase::PropagationPoll);
        self.engine.await_propagation(&pending.tasks).await?;

        self.set_phase(request_id, IssuancePhase::ChallengeRespond);
        for (challenge_url, auth_url) in &pending.challenges {
            let mut attempt = 0u32;
            loop {
                match pending
                    .account
                    .respond_challenge(challenge_url, auth_url, self.acme_poll_delay)
                    .await
                {
                    Ok(()) => break,
                    Err(err) if err.is_retryable() && attempt < MAX_TRANSIENT_RETRIES => {
                        attempt += 1;
                        log::warn!("Transient failure answering challenge (attempt {attempt}): {err}");
                        tokio::time::sleep(self.acme_poll_delay * 2u32.pow(attempt)).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        self.set_phase(request_id, IssuancePhase::AuthorizationValidated);

        self.set_phase(request_id, IssuancePhase::Finalize);
        let csr_der = match &pending.key {
            PreparedKey::Generated(signing_key) => {
                let csr = keys::create_csr(signing_key, &pending.domains)?;
                keys::csr_to_der(&csr)?
            }
            PreparedKey::External { csr_der } => csr_der.clone(),
        };
        let mut attempt = 0u32;
        let order = loop {
            match pending
                .account
                .finalize(&pending.order, &csr_der, self.acme_poll_delay)
                .await
            {
                Ok(order) => break order,
                Err(err) if err.is_retryable() && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    log::warn!("Transient failure finalizing (attempt {attempt}): {err}");
                    tokio::time::sleep(self.acme_poll_delay * 2u32.pow(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        };

        self.set_phase(request_id, IssuancePhase::CertificateDownload);
        let chain_pem = pending.account.download_certificate(&order).await?;

        let parts = keys::parse_chain_pem(&chain_pem)?;

        let (source, key_ref) = match &pending.key {
            PreparedKey::Generated(signing_key) => {
                use pkcs8::EncodePrivateKey as _;
                let der = signing_key
                    .to_pkcs8_der()
                    .map_err(|err| Error::Other(format!("cannot encode certificate key: {err}")))?;
                let key_ref = self.vault.store(
                    SecretKind::ManagedPrivateKey,
                    &format!("key for {}", pending.domains[0]),
                    der.as_bytes(),
                )?;
                (CertificateSource::Managed, Some(key_ref))
            }
            PreparedKey::External { .. } => (CertificateSource::ExternalCsr, None),
        };

        let record = CertificateRecord {
            id: new_id("crt"),
            subjects: parts.subjects,
            issuer_id: Some(pending.request.issuer_id.clone()),
            serial: parts.serial,
            not_before: parts.not_before.unix_timestamp(),
            not_after: parts.not_after.unix_timestamp(),
            fingerprint_sha256: parts.fingerprint_sha256,
            source,
            key_ref,
            chain_pem,
            renewed_from: None,
            revoked_at: None,
            revocation_reason: None,
        };

        self.inventory.save_certificate(record.clone());
        Ok(record)
    }

    /// Abandon a paused request. In-flight calls are allowed to finish (an
    /// active request cannot be abandoned); abandoned requests never
    /// auto-retry.
    pub async fn abandon(&self, request_id: &str) -> Result<()> {
        let _guard = self.claim(request_id)?;

        let pending = self
            .pending
            .lock()
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(format!("no paused request {request_id}")))?;

        self.engine.cleanup(&pending.tasks).await;
        self.set_phase(request_id, IssuancePhase::Failed);
        self.progress.lock().remove(request_id);
        Ok(())
    }

    async fn ensure_account(
        &self,
        client: &AcmeClient,
        mut issuer: IssuerConfig,
    ) -> Result<AcmeAccount> {
        match &issuer.account_key_ref {
            Some(secret_ref) => {
                let der = self.vault.resolve(secret_ref)?;
                let key = AcmeKey::from_pkcs8_der(&der)?;
                client
                    .ensure_account(key, &issuer.contact, issuer.tos_agreed)
                    .await
            }
            None => {
                let key = AcmeKey::generate();
                let account = client
                    .ensure_account(key, &issuer.contact, issuer.tos_agreed)
                    .await?;

                // persist only the reference; the key itself stays in the vault
                let der = account.acme_key().to_pkcs8_der()?;
                let secret_ref = self.vault.store(
                    SecretKind::AccountKey,
                    &format!("{} account key", issuer.issuer_id),
                    &der,
                )?;
                issuer.account_key_ref = Some(secret_ref);
                self.inventory.save_issuer(issuer);

                Ok(account)
            }
        }
    }
}

/// Pure request validation: domain syntax, key parameters, CSR consistency.
fn validate_request(request: &StartIssuance) -> Result<(Vec<String>, PreparedKey)> {
    match &request.key_source {
        KeySource::Generate(params) => {
            params.validate()?;
            if request.domains.is_empty() {
                return Err(Error::validation("no domains requested"));
            }
            for domain in &request.domains {
                validate_domain(domain)?;
            }

            let mut domains = Vec::new();
            for domain in &request.domains {
                if !domains.contains(domain) {
                    domains.push(domain.clone());
                }
            }
            Ok((domains, PreparedKey::Generated(keys::create_p256_key())))
        }
        KeySource::ExternalCsr { csr_pem } => {
            let csr = keys::csr_from_pem(csr_pem)?;
            let csr_domains = keys::csr_names(&csr)?;
            for domain in &csr_domains {
                validate_domain(domain)?;
            }

            // the CSR's SAN set is authoritative; a supplied list may only
            // confirm it
            for domain in &request.domains {
                if !csr_domains.contains(domain) {
                    return Err(Error::Validation(format!(
                        "domain {domain} is not covered by the supplied CSR"
                    )));
                }
            }

            let csr_der = keys::csr_to_der(&csr)?;
            Ok((csr_domains, PreparedKey::External { csr_der }))
        }
    }
}

fn validate_domain(domain: &str) -> Result<()> {
    let name = domain.strip_prefix("*.").unwrap_or(domain);

    let valid = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
        && name.contains('.');

    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid domain name: {domain}")))
    }
}
