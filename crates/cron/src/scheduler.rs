//! Per-job run loop: computes fire times, launches invocations, and applies
//! cancellation and grace-period rules.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tokio::{sync::watch, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{Instrument, debug, info, info_span, warn},
};

#[cfg(feature = "metrics")]
use jobkit_metrics::{counter, gauge, histogram, jobs, labels};

use crate::{
    Error, Result,
    invocation::{InvocationRecord, JobInvocation},
    job::{Job, JobDefinition},
    output::OutputBuffer,
    parameters::Parameters,
    stats::JobStats,
    status::{InvocationStatus, LifecycleEvent},
    task::describe_join_error,
};

/// How often stop and cancel check whether a run ended on its own.
pub const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Observable state of a scheduler's run loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Unstarted,
    Running,
    Stopped,
}

impl SchedulerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Latch {
    Unstarted,
    Running,
    Stopping,
    Stopped,
}

impl Latch {
    fn observed(self) -> SchedulerState {
        match self {
            Self::Unstarted => SchedulerState::Unstarted,
            Self::Running | Self::Stopping => SchedulerState::Running,
            Self::Stopped => SchedulerState::Stopped,
        }
    }
}

struct Inner {
    latch: Latch,
    stop: CancellationToken,
    next_runtime: Option<DateTime<Utc>>,
    current: Option<Arc<JobInvocation>>,
    last: Option<Arc<JobInvocation>>,
    disabled: bool,
}

/// Serializable snapshot of a scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct JobSchedulerStatus {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub schedule: String,
    pub state: SchedulerState,
    pub disabled: bool,
    pub labels: BTreeMap<String, String>,
    pub next_runtime: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub current: Option<InvocationRecord>,
    pub last: Option<InvocationRecord>,
}

/// Owns one job's recurring execution.
///
/// Always held as `Arc<JobScheduler>`: spawned invocations keep a handle to
/// rotate `current` into `last` when they finish.
pub struct JobScheduler {
    job: Arc<Job>,
    inner: Mutex<Inner>,
    loop_running: watch::Sender<bool>,
}

impl JobScheduler {
    pub fn new(job: Job) -> Arc<Self> {
        let disabled = job.definition().disabled;
        let (loop_running, _) = watch::channel(false);
        Arc::new(Self {
            job: Arc::new(job),
            inner: Mutex::new(Inner {
                latch: Latch::Unstarted,
                stop: CancellationToken::new(),
                next_runtime: None,
                current: None,
                last: None,
                disabled,
            }),
            loop_running,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.job.name()
    }

    #[must_use]
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    #[must_use]
    pub fn definition(&self) -> &JobDefinition {
        self.job.definition()
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.lock().latch.observed()
    }

    #[must_use]
    pub fn next_runtime(&self) -> Option<DateTime<Utc>> {
        self.lock().next_runtime
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<JobInvocation>> {
        self.lock().current.clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<Arc<JobInvocation>> {
        self.lock().last.clone()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock().current.is_none()
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }

    /// Not disabled and nothing running.
    #[must_use]
    pub fn can_be_scheduled(&self) -> bool {
        let inner = self.lock();
        !inner.disabled && inner.current.is_none()
    }

    /// Definition labels plus the scheduler's own.
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.definition().labels.clone();
        let (state, active, disabled, last) = {
            let inner = self.lock();
            (
                inner.latch.observed(),
                inner.current.is_some(),
                inner.disabled,
                inner.last.as_ref().map(|l| l.status()),
            )
        };
        labels.insert("name".into(), jobkit_common::slugify(self.name()));
        labels.insert("scheduler".into(), state.as_str().into());
        labels.insert("active".into(), active.to_string());
        labels.insert("enabled".into(), (!disabled).to_string());
        if let Some(last) = last.or_else(|| self.job.latest_status()) {
            labels.insert("last".into(), last.as_str().into());
        }
        labels
    }

    #[must_use]
    pub fn status(&self) -> JobSchedulerStatus {
        let definition = self.definition();
        let labels = self.labels();
        let inner = self.lock();
        JobSchedulerStatus {
            name: definition.name.clone(),
            description: definition.description.clone(),
            schedule: definition.schedule.to_string(),
            state: inner.latch.observed(),
            disabled: inner.disabled,
            labels,
            next_runtime: inner.next_runtime,
            timeout_ms: u64::try_from(definition.timeout.as_millis()).unwrap_or(u64::MAX),
            current: inner.current.as_ref().map(|c| c.record()),
            last: inner.last.as_ref().map(|l| l.record()),
        }
    }

    /// Retained history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<InvocationRecord> {
        self.job.history()
    }

    #[must_use]
    pub fn stats(&self) -> JobStats {
        JobStats::from_records(self.name(), &self.history())
    }

    /// The current or last invocation with this id, if it is still live.
    #[must_use]
    pub fn live_invocation(&self, id: &str) -> Option<Arc<JobInvocation>> {
        let inner = self.lock();
        [inner.current.as_ref(), inner.last.as_ref()]
            .into_iter()
            .flatten()
            .find(|i| i.id() == id)
            .cloned()
    }

    /// Record of an invocation: current, last, or from history.
    pub fn invocation_record(&self, id: &str) -> Result<InvocationRecord> {
        if let Some(live) = self.live_invocation(id) {
            return Ok(live.record());
        }
        self.job
            .history_record(id)
            .ok_or_else(|| Error::invocation_not_found(self.name(), id))
    }

    /// Run the schedule loop until [`stop`](Self::stop).
    ///
    /// Returns at once for schedules that never fire on their own.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let stop = self.begin()?;
        self.run_until_stopped(stop).await;
        Ok(())
    }

    /// Move the latch to running. Split from the loop so a caller that
    /// spawns the loop observes the running state synchronously.
    pub(crate) fn begin(&self) -> Result<CancellationToken> {
        let mut inner = self.lock();
        if matches!(inner.latch, Latch::Running | Latch::Stopping) {
            return Err(Error::CannotStart {
                job: self.name().to_string(),
            });
        }
        inner.latch = Latch::Running;
        inner.stop = CancellationToken::new();
        self.loop_running.send_replace(true);
        Ok(inner.stop.clone())
    }

    pub(crate) async fn run_until_stopped(self: &Arc<Self>, stop: CancellationToken) {
        debug!(job = %self.name(), "scheduler started");
        self.run_loop(&stop).await;
        {
            let mut inner = self.lock();
            inner.latch = Latch::Stopped;
            inner.next_runtime = None;
        }
        self.loop_running.send_replace(false);
        debug!(job = %self.name(), "scheduler stopped");
    }

    async fn run_loop(self: &Arc<Self>, stop: &CancellationToken) {
        let schedule = &self.definition().schedule;
        let mut next = schedule.next(None);
        loop {
            self.lock().next_runtime = next;
            let Some(at) = next else {
                return;
            };

            let wait = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                () = stop.cancelled() => return,
                () = tokio::time::sleep(wait) => {},
            }

            if stop.is_cancelled() {
                return;
            }

            #[cfg(feature = "metrics")]
            histogram!(jobs::SCHEDULE_LATENCY_SECONDS, labels::JOB => self.name().to_string())
                .record((Utc::now() - at).to_std().unwrap_or_default().as_secs_f64());

            if self.can_be_scheduled() {
                if let Err(e) = self.run_async(&CancellationToken::new(), None) {
                    warn!(job = %self.name(), error = %e, "scheduled run failed to start");
                }
            } else {
                debug!(job = %self.name(), "skipping scheduled run: disabled or still running");
            }

            next = schedule.next(Some(at));
        }
    }

    /// Stop the loop, letting an in-flight run finish within the grace
    /// period before it is cancelled.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.latch == Latch::Running {
                inner.latch = Latch::Stopping;
                inner.stop.cancel();
            }
        }

        // The loop can still dispatch until it exits.
        let mut running = self.loop_running.subscribe();
        let _ = running.wait_for(|running| !*running).await;

        if let Some(invocation) = self.cancel_with_grace().await {
            invocation.wait().await;
        }

        self.lock().next_runtime = None;
        Ok(())
    }

    /// Cancel the current run after the grace period. A no-op when idle.
    pub async fn cancel(&self) -> Result<()> {
        self.cancel_with_grace().await;
        Ok(())
    }

    async fn cancel_with_grace(&self) -> Option<Arc<JobInvocation>> {
        let invocation = self.current()?;
        let grace = self.definition().shutdown_grace_period;
        if !grace.is_zero() {
            debug!(job = %self.name(), invocation = %invocation.id(), ?grace, "waiting for run to finish");
            let deadline = Instant::now() + grace;
            loop {
                if invocation.status().is_terminal() {
                    return Some(invocation);
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(GRACE_POLL_INTERVAL.min(deadline - now)).await;
            }
        }
        if !invocation.status().is_terminal() {
            info!(job = %self.name(), invocation = %invocation.id(), "cancelling run");
            invocation.cancel();
        }
        Some(invocation)
    }

    /// Start a run in the background and return it immediately.
    ///
    /// Fails with [`Error::AlreadyRunning`] if a run is in flight, or
    /// [`Error::MissingParameter`] if a required parameter has no value.
    pub fn run_async(
        self: &Arc<Self>,
        parent: &CancellationToken,
        parameters: Option<&Parameters>,
    ) -> Result<Arc<JobInvocation>> {
        let invocation = {
            let mut inner = self.lock();
            if inner.current.is_some() {
                #[cfg(feature = "metrics")]
                counter!(jobs::ALREADY_RUNNING_TOTAL, labels::JOB => self.name().to_string())
                    .increment(1);
                return Err(Error::already_running(self.name()));
            }
            let parameters = self.definition().resolve_parameters(parameters)?;
            let invocation = Arc::new(JobInvocation::new(
                self.name(),
                parameters,
                OutputBuffer::new(),
                self.job.timeout(),
                parent.child_token(),
            ));
            inner.current = Some(Arc::clone(&invocation));
            invocation
        };

        let span = info_span!("job", job = %self.name(), invocation = %invocation.id());
        tokio::spawn(
            Arc::clone(self)
                .execute(Arc::clone(&invocation))
                .instrument(span),
        );
        Ok(invocation)
    }

    /// Start a run and wait for all of its completion handling.
    pub async fn run(
        self: &Arc<Self>,
        parent: &CancellationToken,
        parameters: Option<&Parameters>,
    ) -> Result<InvocationRecord> {
        let invocation = self.run_async(parent, parameters)?;
        invocation.wait().await;
        Ok(invocation.record())
    }

    pub async fn enable(&self) {
        self.lock().disabled = false;
        info!(job = %self.name(), "job enabled");
        self.job.on_job_event(LifecycleEvent::Enabled).await;
    }

    /// Stop scheduling new runs. An in-flight run continues.
    pub async fn disable(&self) {
        self.lock().disabled = true;
        info!(job = %self.name(), "job disabled");
        self.job.on_job_event(LifecycleEvent::Disabled).await;
    }

    async fn execute(self: Arc<Self>, invocation: Arc<JobInvocation>) {
        invocation.mark_running();
        info!("run started");
        #[cfg(feature = "metrics")]
        {
            counter!(jobs::INVOCATIONS_TOTAL, labels::JOB => self.name().to_string()).increment(1);
            gauge!(jobs::RUNNING).increment(1.0);
        }
        let _release = Release {
            scheduler: Arc::clone(&self),
            invocation: Arc::clone(&invocation),
        };
        self.job
            .on_invocation_event(LifecycleEvent::Begin, &invocation.record())
            .await;

        let (status, error) = self.run_action(&invocation).await;

        let previous = self
            .last()
            .map(|last| last.status())
            .or_else(|| self.job.latest_status());
        invocation.finish(status, error.clone());
        let record = invocation.record();

        match (&status, &error) {
            (InvocationStatus::Success, _) => {
                info!(elapsed = ?record.elapsed(), "run succeeded");
            },
            (_, Some(error)) => {
                warn!(status = %status, elapsed = ?record.elapsed(), error = %error, "run failed");
            },
            _ => warn!(status = %status, elapsed = ?record.elapsed(), "run failed"),
        }

        self.job.record_completion(&record).await;
        if let Some(event) = LifecycleEvent::for_outcome(status) {
            self.job.on_invocation_event(event, &record).await;
        }
        self.job
            .on_invocation_event(LifecycleEvent::Complete, &record)
            .await;
        if let Some(transition) = LifecycleEvent::transition(previous, status) {
            info!(transition = %transition, "job state changed");
            self.job.on_invocation_event(transition, &record).await;
        }
    }

    /// Rotate `current` into `last`.
    fn rotate(&self, invocation: &Arc<JobInvocation>) {
        let mut inner = self.lock();
        if inner
            .current
            .as_ref()
            .is_some_and(|c| c.id() == invocation.id())
        {
            inner.current = None;
        }
        inner.last = Some(Arc::clone(invocation));
    }

    /// Run the action on its own task, racing cancellation and the timeout.
    async fn run_action(
        &self,
        invocation: &Arc<JobInvocation>,
    ) -> (InvocationStatus, Option<String>) {
        let token = invocation.cancel_token().clone();
        let action = (self.definition().action)(Arc::clone(invocation));
        let mut handle = tokio::spawn(action.in_current_span());

        let timeout = invocation.timeout();
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            () = token.cancelled() => None,
            () = deadline => {
                token.cancel();
                handle.abort();
                return (
                    InvocationStatus::Cancelled,
                    Some(format!(
                        "timed out after {}",
                        crate::parse::format_duration(timeout.unwrap_or_default())
                    )),
                );
            },
        };

        if token.is_cancelled() {
            handle.abort();
            return (InvocationStatus::Cancelled, Some("cancelled".into()));
        }
        match joined {
            Some(Ok(Ok(()))) => (InvocationStatus::Success, None),
            Some(Ok(Err(e))) => (InvocationStatus::Errored, Some(format!("{e:#}"))),
            Some(Err(join)) => (InvocationStatus::Errored, Some(describe_join_error(join))),
            None => (InvocationStatus::Cancelled, Some("cancelled".into())),
        }
    }
}

/// Frees the job when `execute` ends, including by unwinding: the run is
/// forced terminal, rotated out of `current`, and its waiters are released.
struct Release {
    scheduler: Arc<JobScheduler>,
    invocation: Arc<JobInvocation>,
}

impl Drop for Release {
    fn drop(&mut self) {
        if self.invocation.finish(
            InvocationStatus::Errored,
            Some("panic during completion handling".into()),
        ) {
            warn!(job = %self.scheduler.name(), invocation = %self.invocation.id(), "run ended without completion handling");
        }
        self.scheduler.rotate(&self.invocation);
        #[cfg(feature = "metrics")]
        gauge!(jobs::RUNNING).decrement(1.0);
        self.invocation.signal_done();
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
