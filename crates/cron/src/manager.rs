//! A named collection of job schedulers.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};

use {
    futures::future::join_all,
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use jobkit_metrics::{gauge, jobs};

use crate::{
    Error, Result,
    invocation::{InvocationRecord, JobInvocation},
    job::Job,
    parameters::Parameters,
    scheduler::{JobScheduler, JobSchedulerStatus, SchedulerState},
};

/// Snapshot of every loaded job.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub state: SchedulerState,
    pub jobs: Vec<JobSchedulerStatus>,
    /// Running invocations by job name.
    pub running: BTreeMap<String, InvocationRecord>,
}

/// Loads jobs and fans lifecycle operations out to their schedulers.
///
/// Schedulers never interact; the map lock is only held to look them up.
#[derive(Default)]
pub struct JobManager {
    schedulers: RwLock<BTreeMap<String, Arc<JobScheduler>>>,
    state: Mutex<SchedulerState>,
}

impl JobManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<JobScheduler>>> {
        self.schedulers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<JobScheduler>>> {
        self.schedulers.write().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Add jobs. Fails without loading anything if a name is already loaded
    /// or repeated in the batch. New jobs start at once if the manager runs.
    pub fn load_jobs(&self, jobs: impl IntoIterator<Item = Job>) -> Result<()> {
        let jobs: Vec<Job> = jobs.into_iter().collect();
        let running = self.is_running();
        let mut schedulers = self.write();

        let mut seen = HashSet::new();
        for job in &jobs {
            if schedulers.contains_key(job.name()) || !seen.insert(job.name().to_string()) {
                return Err(Error::DuplicateJob {
                    job: job.name().to_string(),
                });
            }
        }

        for job in jobs {
            let scheduler = JobScheduler::new(job);
            debug!(job = %scheduler.name(), schedule = %scheduler.definition().schedule, "job loaded");
            if running {
                spawn_scheduler(&scheduler);
            }
            schedulers.insert(scheduler.name().to_string(), scheduler);
        }

        #[cfg(feature = "metrics")]
        gauge!(jobs::LOADED).set(schedulers.len() as f64);
        Ok(())
    }

    /// Stop and remove jobs by name.
    pub async fn unload_jobs<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let mut errors = Vec::new();
        let mut removed = Vec::new();
        {
            let mut schedulers = self.write();
            for name in names {
                match schedulers.remove(name.as_ref()) {
                    Some(scheduler) => removed.push(scheduler),
                    None => errors.push(Error::job_not_found(name.as_ref())),
                }
            }
            #[cfg(feature = "metrics")]
            gauge!(jobs::LOADED).set(schedulers.len() as f64);
        }
        for result in join_all(removed.iter().map(|s| s.stop())).await {
            if let Err(e) = result {
                errors.push(e);
            }
        }
        Error::collect(errors)
    }

    /// Scheduler by name.
    pub fn job(&self, name: &str) -> Result<Arc<JobScheduler>> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::job_not_found(name))
    }

    /// Every scheduler, ordered by name.
    #[must_use]
    pub fn jobs(&self) -> Vec<Arc<JobScheduler>> {
        self.read().values().cloned().collect()
    }

    /// Spawn every scheduler's loop and return.
    pub fn start_async(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SchedulerState::Running;
        let schedulers = self.jobs();
        info!(jobs = schedulers.len(), "starting job manager");
        for scheduler in &schedulers {
            spawn_scheduler(scheduler);
        }
    }

    /// Stop every scheduler concurrently.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == SchedulerState::Running {
                *state = SchedulerState::Stopped;
            }
        }
        let schedulers = self.jobs();
        info!(jobs = schedulers.len(), "stopping job manager");
        let errors = join_all(schedulers.iter().map(|s| s.stop()))
            .await
            .into_iter()
            .filter_map(std::result::Result::err)
            .collect();
        Error::collect(errors)
    }

    /// Start a run of `name` in the background.
    pub fn run_job(&self, name: &str, parameters: Option<&Parameters>) -> Result<Arc<JobInvocation>> {
        self.job(name)?
            .run_async(&CancellationToken::new(), parameters)
    }

    /// Cancel the current run of `name`, honouring its grace period.
    pub async fn cancel_job(&self, name: &str) -> Result<()> {
        self.job(name)?.cancel().await
    }

    pub async fn enable_jobs<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let mut errors = Vec::new();
        for name in names {
            match self.job(name.as_ref()) {
                Ok(scheduler) => scheduler.enable().await,
                Err(e) => errors.push(e),
            }
        }
        Error::collect(errors)
    }

    pub async fn disable_jobs<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let mut errors = Vec::new();
        for name in names {
            match self.job(name.as_ref()) {
                Ok(scheduler) => scheduler.disable().await,
                Err(e) => errors.push(e),
            }
        }
        Error::collect(errors)
    }

    pub fn is_job_disabled(&self, name: &str) -> Result<bool> {
        Ok(self.job(name)?.is_disabled())
    }

    pub fn is_job_running(&self, name: &str) -> Result<bool> {
        Ok(!self.job(name)?.is_idle())
    }

    /// Invocations in flight, by job name.
    #[must_use]
    pub fn running(&self) -> BTreeMap<String, Arc<JobInvocation>> {
        self.jobs()
            .into_iter()
            .filter_map(|s| s.current().map(|c| (s.name().to_string(), c)))
            .collect()
    }

    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        let schedulers = self.jobs();
        ManagerStatus {
            state: self.state(),
            running: schedulers
                .iter()
                .filter_map(|s| s.current().map(|c| (s.name().to_string(), c.record())))
                .collect(),
            jobs: schedulers.iter().map(|s| s.status()).collect(),
        }
    }
}

fn spawn_scheduler(scheduler: &Arc<JobScheduler>) {
    match scheduler.begin() {
        Ok(stop) => {
            let scheduler = Arc::clone(scheduler);
            tokio::spawn(async move { scheduler.run_until_stopped(stop).await });
        },
        Err(e) => warn!(job = %scheduler.name(), error = %e, "scheduler not started"),
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("state", &self.state())
            .field("jobs", &self.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
