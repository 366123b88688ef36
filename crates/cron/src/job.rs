//! Job definitions and the wrapper that glues lifecycle events to hooks,
//! notifications, metrics, and history.

use std::{collections::BTreeMap, fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    chrono::Utc,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use jobkit_metrics::{counter, histogram, history as history_metrics, jobs, labels};

use crate::{
    Result,
    history::{HistoryPolicy, HistoryStore},
    history_memory::MemoryHistory,
    invocation::{InvocationRecord, JobInvocation},
    lifecycle::JobLifecycle,
    parameters::{Parameter, Parameters, resolve_parameters},
    schedule::Schedule,
    status::{InvocationStatus, LifecycleEvent},
    task::{catch_panic, spawn_catching},
};

pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// The work a job performs. It receives the live invocation for its
/// parameters, output buffer and cancellation token.
pub type Action = Arc<dyn Fn(Arc<JobInvocation>) -> ActionFuture + Send + Sync>;

/// Wrap a closure returning a future as an [`Action`].
pub fn action<F, Fut>(f: F) -> Action
where
    F: Fn(Arc<JobInvocation>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |invocation| Box::pin(f(invocation)))
}

/// Which lifecycle events are sent to the notifier, and how deliveries retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationPolicy {
    pub on_begin: bool,
    pub on_complete: bool,
    pub on_success: bool,
    pub on_error: bool,
    pub on_cancellation: bool,
    pub on_broken: bool,
    pub on_fixed: bool,
    pub on_enabled: bool,
    pub on_disabled: bool,
    /// Delivery attempts per message; `0` retries forever.
    pub max_attempts: u32,
    pub retry_wait: Duration,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            on_begin: false,
            on_complete: false,
            on_success: false,
            on_error: true,
            on_cancellation: true,
            on_broken: true,
            on_fixed: true,
            on_enabled: false,
            on_disabled: false,
            max_attempts: 5,
            retry_wait: Duration::from_secs(5),
        }
    }
}

impl NotificationPolicy {
    #[must_use]
    pub fn enabled(&self, event: LifecycleEvent) -> bool {
        match event {
            LifecycleEvent::Begin => self.on_begin,
            LifecycleEvent::Complete => self.on_complete,
            LifecycleEvent::Success => self.on_success,
            LifecycleEvent::Errored => self.on_error,
            LifecycleEvent::Cancelled => self.on_cancellation,
            LifecycleEvent::Broken => self.on_broken,
            LifecycleEvent::Fixed => self.on_fixed,
            LifecycleEvent::Enabled => self.on_enabled,
            LifecycleEvent::Disabled => self.on_disabled,
        }
    }
}

/// Static description of a job, fixed for the lifetime of its scheduler.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub description: String,
    pub schedule: Schedule,
    pub action: Action,
    /// Deadline per run; zero means none.
    pub timeout: Duration,
    /// How long stop and cancel wait for a run to end on its own.
    pub shutdown_grace_period: Duration,
    pub labels: BTreeMap<String, String>,
    pub parameters: Vec<Parameter>,
    /// Start disabled.
    pub disabled: bool,
    pub notifications: NotificationPolicy,
    pub history: HistoryPolicy,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, schedule: Schedule, action: Action) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schedule,
            action,
            timeout: Duration::ZERO,
            shutdown_grace_period: Duration::ZERO,
            labels: BTreeMap::new(),
            parameters: Vec::new(),
            disabled: false,
            notifications: NotificationPolicy::default(),
            history: HistoryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    #[must_use]
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    #[must_use]
    pub fn with_notifications(mut self, policy: NotificationPolicy) -> Self {
        self.notifications = policy;
        self
    }

    #[must_use]
    pub fn with_history(mut self, policy: HistoryPolicy) -> Self {
        self.history = policy;
        self
    }

    /// Merge declared defaults with `provided`.
    pub fn resolve_parameters(&self, provided: Option<&Parameters>) -> Result<Parameters> {
        resolve_parameters(&self.name, &self.parameters, provided)
    }

    fn timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("schedule", &self.schedule.to_string())
            .field("timeout", &self.timeout)
            .field("shutdown_grace_period", &self.shutdown_grace_period)
            .field("labels", &self.labels)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

/// Receives lifecycle events the job's policy has enabled.
///
/// Implementations should hand work off quickly; `notify` is awaited on the
/// invocation's completion path.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        event: LifecycleEvent,
        definition: &JobDefinition,
        record: Option<&InvocationRecord>,
    ) -> Result<()>;
}

/// A job definition plus everything that reacts to its lifecycle.
pub struct Job {
    definition: JobDefinition,
    lifecycle: JobLifecycle,
    notifier: Option<Arc<dyn Notifier>>,
    store: Option<Arc<dyn HistoryStore>>,
    history: MemoryHistory,
}

impl Job {
    pub fn new(definition: JobDefinition) -> Self {
        Self {
            definition,
            lifecycle: JobLifecycle::default(),
            notifier: None,
            store: None,
            history: MemoryHistory::new(),
        }
    }

    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: JobLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Durable store written alongside the in-memory history.
    #[must_use]
    pub fn with_history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Retained records, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<InvocationRecord> {
        self.history.records(self.name())
    }

    #[must_use]
    pub fn history_record(&self, id: &str) -> Option<InvocationRecord> {
        self.history.record(self.name(), id)
    }

    /// Status of the newest retained record.
    #[must_use]
    pub fn latest_status(&self) -> Option<InvocationStatus> {
        self.history.latest(self.name()).map(|r| r.status)
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.definition.timeout()
    }

    /// Load durable records into memory. Failures are logged.
    pub async fn restore_history(&self) {
        let policy = self.definition.history;
        if policy.disabled || policy.persistence_disabled {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        match store.restore(self.name()).await {
            Ok(records) => {
                debug!(job = %self.name(), count = records.len(), "restored history");
                self.history.replace(self.name(), records);
                self.history
                    .cull_at(self.name(), policy.max_count, policy.max_age, Utc::now());
            },
            Err(e) => warn!(job = %self.name(), error = %e, "failed to restore history"),
        }
    }

    /// Append a terminal record to memory and the durable store, then cull.
    pub(crate) async fn record_completion(&self, record: &InvocationRecord) {
        #[cfg(feature = "metrics")]
        {
            counter!(
                jobs::COMPLETIONS_TOTAL,
                labels::JOB => self.name().to_string(),
                labels::STATUS => record.status.as_str()
            )
            .increment(1);
            histogram!(
                jobs::INVOCATION_DURATION_SECONDS,
                labels::JOB => self.name().to_string()
            )
            .record(record.elapsed().as_secs_f64());
        }

        let policy = self.definition.history;
        if policy.disabled {
            return;
        }
        self.history.push(record.clone());
        #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
        let culled = self
            .history
            .cull_at(self.name(), policy.max_count, policy.max_age, Utc::now());
        #[cfg(feature = "metrics")]
        {
            counter!(history_metrics::RECORDS_ADDED_TOTAL, labels::BACKEND => "memory")
                .increment(1);
            counter!(history_metrics::RECORDS_CULLED_TOTAL, labels::BACKEND => "memory")
                .increment(culled as u64);
        }

        if policy.persistence_disabled {
            return;
        }
        if let Err(panic) = catch_panic(self.persist(record)).await {
            warn!(job = %self.name(), invocation = %record.id, error = %panic, "history store failed");
        }
    }

    async fn persist(&self, record: &InvocationRecord) {
        let Some(store) = &self.store else {
            return;
        };
        let policy = self.definition.history;
        if let Err(e) = store.add(record).await {
            warn!(job = %self.name(), invocation = %record.id, error = %e, "failed to persist history");
            #[cfg(feature = "metrics")]
            counter!(history_metrics::ERRORS_TOTAL, labels::BACKEND => "durable").increment(1);
            return;
        }
        match store
            .cull(self.name(), policy.max_count, policy.max_age)
            .await
        {
            #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
            Ok(removed) => {
                #[cfg(feature = "metrics")]
                counter!(history_metrics::RECORDS_CULLED_TOTAL, labels::BACKEND => "durable")
                    .increment(removed as u64);
            },
            Err(e) => {
                warn!(job = %self.name(), error = %e, "failed to cull history");
                #[cfg(feature = "metrics")]
                counter!(history_metrics::ERRORS_TOTAL, labels::BACKEND => "durable")
                    .increment(1);
            },
        }
    }

    /// Fire the user hook and notifier for an invocation event.
    pub(crate) async fn on_invocation_event(&self, event: LifecycleEvent, record: &InvocationRecord) {
        self.count_transition(event);
        if let Some(hook) = self.lifecycle.invocation_hook(event) {
            let fut = hook(record.clone());
            if let Err(panic) = spawn_catching(fut).await {
                warn!(job = %self.name(), invocation = %record.id, event = %event, error = %panic, "lifecycle hook failed");
            }
        }
        self.notify(event, Some(record)).await;
    }

    /// Fire the user hook and notifier for enable/disable.
    pub(crate) async fn on_job_event(&self, event: LifecycleEvent) {
        self.count_transition(event);
        if let Some(hook) = self.lifecycle.job_hook(event) {
            let fut = hook(self.name().to_string());
            if let Err(panic) = spawn_catching(fut).await {
                warn!(job = %self.name(), event = %event, error = %panic, "lifecycle hook failed");
            }
        }
        self.notify(event, None).await;
    }

    async fn notify(&self, event: LifecycleEvent, record: Option<&InvocationRecord>) {
        if !self.definition.notifications.enabled(event) {
            return;
        }
        let Some(notifier) = &self.notifier else {
            return;
        };
        match catch_panic(notifier.notify(event, &self.definition, record)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                warn!(job = %self.name(), event = %event, error = %e, "failed to enqueue notification");
            },
            Err(panic) => warn!(job = %self.name(), event = %event, error = %panic, "notifier failed"),
        }
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn count_transition(&self, event: LifecycleEvent) {
        #[cfg(feature = "metrics")]
        counter!(
            jobs::TRANSITIONS_TOTAL,
            labels::JOB => self.name().to_string(),
            labels::FLAG => event.flag()
        )
        .increment(1);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("definition", &self.definition)
            .field("lifecycle", &self.lifecycle)
            .field("notifier", &self.notifier.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl From<JobDefinition> for Job {
    fn from(definition: JobDefinition) -> Self {
        Self::new(definition)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            history::testing::record,
            history_memory::MemoryHistory,
            lifecycle::{invocation_hook, job_hook},
        },
        std::sync::Mutex,
    };

    fn noop() -> Action {
        action(|_| async { Ok(()) })
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(LifecycleEvent, Option<String>)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            event: LifecycleEvent,
            _definition: &JobDefinition,
            record: Option<&InvocationRecord>,
        ) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((event, record.map(|r| r.id.clone())));
            Ok(())
        }
    }

    #[test]
    fn notification_defaults() {
        let policy = NotificationPolicy::default();
        let enabled: Vec<_> = LifecycleEvent::ALL
            .into_iter()
            .filter(|e| policy.enabled(*e))
            .collect();
        assert_eq!(enabled, vec![
            LifecycleEvent::Errored,
            LifecycleEvent::Cancelled,
            LifecycleEvent::Broken,
            LifecycleEvent::Fixed,
        ]);
    }

    #[tokio::test]
    async fn notifies_only_enabled_events() {
        let notifier = Arc::new(RecordingNotifier::default());
        let job = Job::new(JobDefinition::new("backup", Schedule::OnDemand, noop()))
            .with_notifier(notifier.clone());
        let rec = record("backup", "1", Duration::from_secs(1), Utc::now());

        job.on_invocation_event(LifecycleEvent::Begin, &rec).await;
        job.on_invocation_event(LifecycleEvent::Errored, &rec).await;
        job.on_job_event(LifecycleEvent::Disabled).await;

        let events = notifier.events.lock().unwrap().clone();
        assert_eq!(events, vec![(LifecycleEvent::Errored, Some("1".to_string()))]);
    }

    #[tokio::test]
    async fn panicking_hook_is_contained() {
        let lifecycle = JobLifecycle {
            on_success: Some(invocation_hook(|_| async { panic!("hook bug") })),
            on_enabled: Some(job_hook(|_| async { panic!("hook bug") })),
            ..Default::default()
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let policy = NotificationPolicy {
            on_success: true,
            ..Default::default()
        };
        let job = Job::new(
            JobDefinition::new("j", Schedule::OnDemand, noop()).with_notifications(policy),
        )
        .with_lifecycle(lifecycle)
        .with_notifier(notifier.clone());

        let rec = record("j", "1", Duration::ZERO, Utc::now());
        job.on_invocation_event(LifecycleEvent::Success, &rec).await;
        job.on_job_event(LifecycleEvent::Enabled).await;
        // The notifier still runs after the hook panics.
        assert_eq!(notifier.events.lock().unwrap().len(), 1);
    }

    struct PanickingNotifier;

    #[async_trait]
    impl Notifier for PanickingNotifier {
        async fn notify(
            &self,
            _event: LifecycleEvent,
            _definition: &JobDefinition,
            _record: Option<&InvocationRecord>,
        ) -> Result<()> {
            panic!("template exploded")
        }
    }

    #[tokio::test]
    async fn panicking_notifier_is_contained() {
        let job = Job::new(JobDefinition::new("j", Schedule::OnDemand, noop()))
            .with_notifier(Arc::new(PanickingNotifier));
        let rec = record("j", "1", Duration::ZERO, Utc::now());
        job.on_invocation_event(LifecycleEvent::Errored, &rec).await;
        job.record_completion(&rec).await;
        assert_eq!(job.history().len(), 1);
    }

    #[tokio::test]
    async fn completion_writes_memory_and_store_with_retention() {
        let store = Arc::new(MemoryHistory::new());
        let policy = HistoryPolicy {
            max_count: 2,
            ..Default::default()
        };
        let job = Job::new(JobDefinition::new("j", Schedule::OnDemand, noop()).with_history(policy))
            .with_history_store(store.clone());

        let now = Utc::now();
        for (i, age) in [30, 20, 10].into_iter().enumerate() {
            let rec = record("j", &i.to_string(), Duration::from_secs(age), now);
            job.record_completion(&rec).await;
        }

        let ids: Vec<_> = job.history().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(store.len("j"), 2);
        assert!(job.history_record("0").is_none());
    }

    #[tokio::test]
    async fn persistence_disabled_keeps_memory_only() {
        let store = Arc::new(MemoryHistory::new());
        let policy = HistoryPolicy {
            persistence_disabled: true,
            ..Default::default()
        };
        let job = Job::new(JobDefinition::new("j", Schedule::OnDemand, noop()).with_history(policy))
            .with_history_store(store.clone());
        job.record_completion(&record("j", "1", Duration::ZERO, Utc::now()))
            .await;
        assert_eq!(job.history().len(), 1);
        assert_eq!(store.len("j"), 0);
    }

    #[tokio::test]
    async fn history_disabled_keeps_nothing() {
        let policy = HistoryPolicy {
            disabled: true,
            ..Default::default()
        };
        let job = Job::new(JobDefinition::new("j", Schedule::OnDemand, noop()).with_history(policy));
        job.record_completion(&record("j", "1", Duration::ZERO, Utc::now()))
            .await;
        assert!(job.history().is_empty());
    }

    #[tokio::test]
    async fn restore_loads_durable_records() {
        let store = Arc::new(MemoryHistory::new());
        let now = Utc::now();
        let mut errored = record("j", "old", Duration::from_secs(5), now);
        errored.status = InvocationStatus::Errored;
        store.push(errored);

        let job = Job::new(JobDefinition::new("j", Schedule::OnDemand, noop()))
            .with_history_store(store);
        assert!(job.history().is_empty());
        job.restore_history().await;
        assert_eq!(job.history().len(), 1);
        assert_eq!(job.latest_status(), Some(InvocationStatus::Errored));
    }
}
