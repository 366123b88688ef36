//! A single execution of a job and its persisted record.

use std::{sync::Mutex, time::Duration};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
};

use crate::{output::OutputBuffer, parameters::Parameters, status::InvocationStatus};

/// Persisted form of an invocation, keyed by `(job_name, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub id: String,
    pub job_name: String,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<DateTime<Utc>>,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub output: OutputBuffer,
}

impl InvocationRecord {
    /// Wall-clock run time; for a running invocation, time so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let end = self.complete.unwrap_or_else(Utc::now);
        (end - self.started).to_std().unwrap_or_default()
    }
}

#[derive(Debug)]
struct InvocationState {
    started: DateTime<Utc>,
    complete: Option<DateTime<Utc>>,
    status: InvocationStatus,
    error: Option<String>,
}

/// A live execution of a job.
///
/// Shared as `Arc<JobInvocation>` between the scheduler, the action, and
/// readers such as the management API. Only the owning scheduler changes the
/// status; the action appends to [`output`](Self::output).
#[derive(Debug)]
pub struct JobInvocation {
    id: String,
    job_name: String,
    parameters: Parameters,
    output: OutputBuffer,
    timeout: Option<Duration>,
    state: Mutex<InvocationState>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl JobInvocation {
    /// A fresh idle invocation. Schedulers create these; building one by hand
    /// is mostly useful for exercising an action directly.
    pub fn new(
        job_name: impl Into<String>,
        parameters: Parameters,
        output: OutputBuffer,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_name: job_name.into(),
            parameters,
            output,
            timeout,
            state: Mutex::new(InvocationState {
                started: Utc::now(),
                complete: None,
                status: InvocationStatus::Idle,
                error: None,
            }),
            cancel,
            done,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    #[must_use]
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Parameter value by name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// Deadline applied to this run, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn status(&self) -> InvocationStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone()
    }

    #[must_use]
    pub fn started(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).started
    }

    #[must_use]
    pub fn complete(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).complete
    }

    /// Token the action should watch; cancelled on timeout, cancel, or stop.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation. The scheduler records the run as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until the scheduler has finished all completion handling.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so this only returns once done.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Snapshot of the invocation. The output buffer is shared, not copied.
    #[must_use]
    pub fn record(&self) -> InvocationRecord {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        InvocationRecord {
            id: self.id.clone(),
            job_name: self.job_name.clone(),
            started: state.started,
            complete: state.complete,
            status: state.status,
            error: state.error.clone(),
            parameters: self.parameters.clone(),
            output: self.output.clone(),
        }
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.status.can_transition_to(InvocationStatus::Running) {
            state.status = InvocationStatus::Running;
            state.started = Utc::now();
        }
    }

    /// Move to a terminal status. Returns `false` if already terminal.
    pub(crate) fn finish(&self, status: InvocationStatus, error: Option<String>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.status.can_transition_to(status) {
            return false;
        }
        state.status = status;
        state.error = error;
        state.complete = Some(Utc::now());
        true
    }

    pub(crate) fn signal_done(&self) {
        self.done.send_replace(true);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc};

    fn invocation() -> JobInvocation {
        JobInvocation::new(
            "backup",
            Parameters::from([("DB".to_string(), "main".to_string())]),
            OutputBuffer::new(),
            None,
            CancellationToken::new(),
        )
    }

    #[test]
    fn status_follows_the_state_machine() {
        let inv = invocation();
        assert_eq!(inv.status(), InvocationStatus::Idle);
        assert!(!inv.finish(InvocationStatus::Success, None));

        inv.mark_running();
        assert_eq!(inv.status(), InvocationStatus::Running);

        assert!(inv.finish(InvocationStatus::Errored, Some("exit 1".into())));
        assert!(!inv.finish(InvocationStatus::Success, None));

        let record = inv.record();
        assert_eq!(record.status, InvocationStatus::Errored);
        assert_eq!(record.error.as_deref(), Some("exit 1"));
        assert!(record.complete.is_some());
        assert_eq!(record.parameters["DB"], "main");
    }

    #[tokio::test]
    async fn wait_returns_after_done_signal() {
        let inv = Arc::new(invocation());
        let waiter = {
            let inv = Arc::clone(&inv);
            tokio::spawn(async move { inv.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!inv.is_done());
        inv.signal_done();
        waiter.await.unwrap();
        assert!(inv.is_done());

        // Already done: returns immediately.
        inv.wait().await;
    }

    #[test]
    fn record_round_trips_through_json() {
        let inv = invocation();
        inv.output().writeln("dumped 3 tables");
        inv.mark_running();
        inv.finish(InvocationStatus::Success, None);

        let json = serde_json::to_string(&inv.record()).unwrap();
        let record: InvocationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.id, inv.id());
        assert_eq!(record.status, InvocationStatus::Success);
        assert_eq!(record.output.contents(), "dumped 3 tables\n");
    }
}
