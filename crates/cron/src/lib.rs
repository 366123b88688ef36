//! Recurring job scheduling and execution tracking.
//!
//! A [`JobManager`] owns one [`JobScheduler`] per [`Job`]. Each scheduler
//! fires its job on a [`Schedule`], allows at most one [`JobInvocation`] at a
//! time, and hands finished runs to the job's history and notifier.
//! Notifications go through a [`RetryQueue`] so delivery never blocks a run.

pub mod error;
pub mod history;
pub mod history_file;
pub mod history_memory;
pub mod history_sqlite;
pub mod invocation;
pub mod job;
pub mod lifecycle;
pub mod manager;
pub mod output;
pub mod parameters;
pub mod parse;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod stats;
pub mod status;
mod task;

pub use {
    error::{Error, Result},
    history::{HistoryPolicy, HistoryStore},
    history_file::FileHistory,
    history_memory::MemoryHistory,
    history_sqlite::SqliteHistory,
    invocation::{InvocationRecord, JobInvocation},
    job::{Action, Job, JobDefinition, NotificationPolicy, Notifier, action},
    lifecycle::JobLifecycle,
    manager::{JobManager, ManagerStatus},
    output::{OutputBuffer, OutputChunk},
    parameters::{Parameter, Parameters},
    retry::{RetryQueue, RetryWorkItem},
    schedule::Schedule,
    scheduler::{JobScheduler, JobSchedulerStatus, SchedulerState},
    stats::JobStats,
    status::{InvocationStatus, LifecycleEvent},
};

/// Run database migrations for the history tables.
///
/// Creates `job_invocations`. [`SqliteHistory::new`] calls this itself; call
/// it directly when handing a shared pool to [`SqliteHistory::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
