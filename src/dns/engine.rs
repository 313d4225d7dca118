//! Drives DNS-01 record placement and propagation polling for an order.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinSet, time::Instant};

use crate::{
    dns::{DnsAdapter, TxtLookup, TxtObservation},
    Error,
};

/// Floor for the propagation budget; anything shorter gives slow resolvers no
/// realistic chance.
const MIN_BUDGET: Duration = Duration::from_secs(60);

/// Poll cadence and time budget for propagation checks.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub budget: Duration,
}

impl PollSettings {
    /// Clamps the budget to the one-minute minimum.
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self {
            interval,
            budget: budget.max(MIN_BUDGET),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(120))
    }
}

/// One domain's DNS-01 work item.
#[derive(Clone)]
pub struct ChallengeTask {
    pub domain: String,
    pub record_name: String,
    pub expected_value: String,
    pub adapter: Arc<dyn DnsAdapter>,
}

/// Places records through the resolved adapters and watches them propagate.
///
/// Independent domains proceed in parallel; the engine reports success only
/// when every domain's record has been observed. A single domain exhausting
/// the budget fails the phase with a timeout naming that domain.
pub struct DnsChallengeEngine {
    lookup: Arc<dyn TxtLookup>,
    settings: PollSettings,
}

impl DnsChallengeEngine {
    pub fn new(lookup: Arc<dyn TxtLookup>, settings: PollSettings) -> Self {
        Self { lookup, settings }
    }

    /// Upsert every task's TXT record through its adapter.
    pub async fn place(&self, tasks: &[ChallengeTask]) -> Result<(), Error> {
        let mut set = JoinSet::new();
        for task in tasks.iter().cloned() {
            set.spawn(async move {
                task.adapter
                    .present_txt(&task.record_name, &task.expected_value)
                    .await
                    .map_err(Error::from)
            });
        }

        while let Some(joined) = set.join_next().await {
            joined.map_err(|err| Error::Other(format!("placement task panicked: {err}")))??;
        }
        Ok(())
    }

    /// Poll until every task's record is observed, or the budget runs out.
    pub async fn await_propagation(&self, tasks: &[ChallengeTask]) -> Result<(), Error> {
        let mut set = JoinSet::new();
        for task in tasks.iter().cloned() {
            let lookup = Arc::clone(&self.lookup);
            let settings = self.settings;
            set.spawn(async move { poll_domain(lookup, settings, task).await });
        }

        let mut failure: Option<Error> = None;
        while let Some(joined) = set.join_next().await {
            let result =
                joined.map_err(|err| Error::Other(format!("poll task panicked: {err}")))?;
            if let Err(err) = result {
                // first failure wins; a timeout names the offending domain
                failure.get_or_insert(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove every task's record. Best-effort: failures are logged, never
    /// propagated.
    pub async fn cleanup(&self, tasks: &[ChallengeTask]) {
        for task in tasks {
            if let Err(err) = task
                .adapter
                .cleanup_txt(&task.record_name, &task.expected_value)
                .await
            {
                log::warn!(
                    "Cleanup of TXT {} via {} failed: {err}",
                    task.record_name,
                    task.adapter.id()
                );
            }
        }
    }

    /// One probe without waiting, for caller-driven manual rechecks.
    pub async fn poll_once(&self, record_name: &str, expected: &str) -> TxtObservation {
        self.lookup.observe(record_name, expected).await
    }
}

async fn poll_domain(
    lookup: Arc<dyn TxtLookup>,
    settings: PollSettings,
    task: ChallengeTask,
) -> Result<(), Error> {
    let deadline = Instant::now() + settings.budget;

    loop {
        let observation = lookup
            .observe(&task.record_name, &task.expected_value)
            .await;

        match observation {
            TxtObservation::Found => {
                log::debug!("TXT {} observed", task.record_name);
                return Ok(());
            }
            other => {
                log::trace!("TXT {} not ready yet: {other:?}", task.record_name);
            }
        }

        if Instant::now() + settings.interval >= deadline {
            return Err(Error::PropagationTimeout {
                domain: task.domain,
            });
        }
        tokio::time::sleep(settings.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{AdapterError, ManualAdapter, TestOutcome};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lookup that returns a scripted observation per record name, flipping
    /// to `Found` after a set number of probes.
    struct ScriptedLookup {
        found_after: HashMap<String, usize>,
        probes: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedLookup {
        fn new(found_after: &[(&str, usize)]) -> Self {
            Self {
                found_after: found_after
                    .iter()
                    .map(|(name, n)| ((*name).to_owned(), *n))
                    .collect(),
                probes: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl TxtLookup for ScriptedLookup {
        async fn observe(&self, name: &str, _expected: &str) -> TxtObservation {
            let mut probes = self.probes.lock();
            let count = probes.entry(name.to_owned()).or_insert(0);
            *count += 1;
            match self.found_after.get(name) {
                Some(after) if *count > *after => TxtObservation::Found,
                Some(_) => TxtObservation::Pending,
                None => TxtObservation::NxDomain,
            }
        }
    }

    /// Adapter whose cleanup always fails, counting invocations.
    struct FailingCleanup {
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl DnsAdapter for FailingCleanup {
        fn id(&self) -> &str {
            "failing"
        }
        async fn present_txt(&self, _: &str, _: &str) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn cleanup_txt(&self, _: &str, _: &str) -> Result<(), AdapterError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::unknown("provider exploded"))
        }
        async fn test_connection(&self) -> Result<TestOutcome, AdapterError> {
            Ok(TestOutcome {
                detail: String::new(),
            })
        }
    }

    fn task(domain: &str) -> ChallengeTask {
        ChallengeTask {
            domain: domain.to_owned(),
            record_name: format!("_acme-challenge.{domain}"),
            expected_value: "proof".to_owned(),
            adapter: Arc::new(ManualAdapter::new()),
        }
    }

    fn fast_settings() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(5),
            budget: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn succeeds_when_all_domains_found() {
        let lookup = ScriptedLookup::new(&[
            ("_acme-challenge.a.example.com", 0),
            ("_acme-challenge.b.example.com", 2),
        ]);
        let engine = DnsChallengeEngine::new(Arc::new(lookup), fast_settings());

        let tasks = vec![task("a.example.com"), task("b.example.com")];
        engine.place(&tasks).await.unwrap();
        engine.await_propagation(&tasks).await.unwrap();
    }

    #[tokio::test]
    async fn single_timeout_names_the_domain() {
        let lookup = ScriptedLookup::new(&[("_acme-challenge.a.example.com", 0)]);
        let engine = DnsChallengeEngine::new(Arc::new(lookup), fast_settings());

        // b.example.com is never found
        let tasks = vec![task("a.example.com"), task("b.example.com")];
        match engine.await_propagation(&tasks).await {
            Err(Error::PropagationTimeout { domain }) => assert_eq!(domain, "b.example.com"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleanup_failures_are_swallowed() {
        let adapter = Arc::new(FailingCleanup {
            cleanups: AtomicUsize::new(0),
        });
        let lookup = ScriptedLookup::new(&[]);
        let engine = DnsChallengeEngine::new(Arc::new(lookup), fast_settings());

        let tasks = vec![ChallengeTask {
            adapter: Arc::clone(&adapter) as Arc<dyn DnsAdapter>,
            ..task("a.example.com")
        }];

        engine.cleanup(&tasks).await;
        assert_eq!(adapter.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn budget_is_clamped_to_minimum() {
        let settings = PollSettings::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(settings.budget, Duration::from_secs(60));
    }
}
