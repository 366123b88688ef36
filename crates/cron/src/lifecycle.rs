//! Optional async callbacks fired as a job moves through its lifecycle.

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use crate::{invocation::InvocationRecord, status::LifecycleEvent};

pub type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Hook receiving a snapshot of the invocation that triggered it.
pub type InvocationHook = Arc<dyn Fn(InvocationRecord) -> HookFuture + Send + Sync>;

/// Hook receiving the job name (enable/disable have no invocation).
pub type JobHook = Arc<dyn Fn(String) -> HookFuture + Send + Sync>;

/// User hooks for one job. Unset hooks are skipped.
///
/// Each hook runs on its own task, so a panic is logged and contained.
#[derive(Clone, Default)]
pub struct JobLifecycle {
    pub on_begin: Option<InvocationHook>,
    pub on_complete: Option<InvocationHook>,
    pub on_success: Option<InvocationHook>,
    pub on_error: Option<InvocationHook>,
    pub on_cancellation: Option<InvocationHook>,
    pub on_broken: Option<InvocationHook>,
    pub on_fixed: Option<InvocationHook>,
    pub on_enabled: Option<JobHook>,
    pub on_disabled: Option<JobHook>,
}

/// Wrap a closure returning a future as an [`InvocationHook`].
pub fn invocation_hook<F, Fut>(f: F) -> InvocationHook
where
    F: Fn(InvocationRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |record| Box::pin(f(record)))
}

/// Wrap a closure returning a future as a [`JobHook`].
pub fn job_hook<F, Fut>(f: F) -> JobHook
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |name| Box::pin(f(name)))
}

impl JobLifecycle {
    /// Hook for an invocation-scoped event.
    #[must_use]
    pub fn invocation_hook(&self, event: LifecycleEvent) -> Option<&InvocationHook> {
        match event {
            LifecycleEvent::Begin => self.on_begin.as_ref(),
            LifecycleEvent::Complete => self.on_complete.as_ref(),
            LifecycleEvent::Success => self.on_success.as_ref(),
            LifecycleEvent::Errored => self.on_error.as_ref(),
            LifecycleEvent::Cancelled => self.on_cancellation.as_ref(),
            LifecycleEvent::Broken => self.on_broken.as_ref(),
            LifecycleEvent::Fixed => self.on_fixed.as_ref(),
            LifecycleEvent::Enabled | LifecycleEvent::Disabled => None,
        }
    }

    /// Hook for a job-scoped event.
    #[must_use]
    pub fn job_hook(&self, event: LifecycleEvent) -> Option<&JobHook> {
        match event {
            LifecycleEvent::Enabled => self.on_enabled.as_ref(),
            LifecycleEvent::Disabled => self.on_disabled.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for JobLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<_> = LifecycleEvent::ALL
            .into_iter()
            .filter(|e| self.invocation_hook(*e).is_some() || self.job_hook(*e).is_some())
            .map(LifecycleEvent::flag)
            .collect();
        f.debug_struct("JobLifecycle").field("hooks", &set).finish()
    }
}
