//! Building runnable jobs from the config.

use std::sync::Arc;

use {
    anyhow::{Context, Result},
    jobkit_config::{HistoryBackend, JobConfig, JobkitConfig},
    jobkit_cron::{
        FileHistory, HistoryStore, Job, JobDefinition, Notifier, Schedule, SqliteHistory,
    },
    jobkit_notify::{JobNotifier, Senders, SendmailSender, Targets},
    jobkit_shell::ShellAction,
    tracing::{debug, info},
};

/// Jobs ready to load, plus the notifiers that must be started and stopped
/// alongside them.
pub struct Runtime {
    pub jobs: Vec<Job>,
    pub notifiers: Vec<Arc<JobNotifier>>,
}

/// Open the durable history backend. `None` keeps history in memory only.
pub async fn history_store(backend: &HistoryBackend) -> Result<Option<Arc<dyn HistoryStore>>> {
    let store: Arc<dyn HistoryStore> = match backend {
        HistoryBackend::Memory => return Ok(None),
        HistoryBackend::File { path } => {
            info!(path = %path.display(), "using file history");
            Arc::new(FileHistory::new(path))
        },
        HistoryBackend::Sqlite { url } => {
            info!("using sqlite history");
            Arc::new(
                SqliteHistory::new(url)
                    .await
                    .with_context(|| format!("failed to open history database {url}"))?,
            )
        },
    };
    Ok(Some(store))
}

pub fn definition(job: &JobConfig) -> Result<JobDefinition> {
    let schedule = Schedule::parse(&job.schedule)
        .with_context(|| format!("job {}: invalid schedule", job.name))?;
    let shell = ShellAction {
        exec: job.exec.clone(),
        skip_expand_env: job.shell.skip_expand_env,
        discard_output: job.shell.discard_output,
        hide_output: job.shell.hide_output,
        working_dir: job.shell.working_dir.clone(),
        env: job.shell.env.clone(),
    };

    let mut definition = JobDefinition::new(&job.name, schedule, shell.into_action())
        .with_description(&job.description)
        .with_timeout(job.timeout())
        .with_shutdown_grace_period(job.shutdown_grace_period())
        .with_disabled(job.disabled)
        .with_notifications(job.notification_policy())
        .with_history(job.history_policy());
    for (key, value) in &job.labels {
        definition = definition.with_label(key, value);
    }
    for parameter in job.declared_parameters() {
        definition = definition.with_parameter(parameter);
    }
    Ok(definition)
}

/// Build every configured job. A job gets a notifier only when at least one
/// target resolves.
pub fn build(config: &JobkitConfig, store: Option<&Arc<dyn HistoryStore>>) -> Result<Runtime> {
    let http = reqwest::Client::new();
    let mut runtime = Runtime {
        jobs: Vec::with_capacity(config.jobs.len()),
        notifiers: Vec::new(),
    };

    for job_config in &config.jobs {
        let definition = definition(job_config)?;
        let n = &job_config.notifications;
        let targets = Targets::resolve(
            &config.slack,
            &config.email,
            n.slack.as_ref(),
            n.webhook.as_ref(),
            n.email.as_ref(),
        );

        let notifier = (!targets.is_empty()).then(|| {
            let sendmail = targets
                .email
                .as_ref()
                .and_then(|e| e.sendmail_path.clone())
                .map_or_else(SendmailSender::default, SendmailSender::new);
            let senders = Senders::new(http.clone(), Arc::new(sendmail));
            Arc::new(JobNotifier::new(&definition, targets, senders))
        });

        let mut job = Job::new(definition);
        if let Some(notifier) = notifier {
            debug!(job = %job.name(), "notifications enabled");
            job = job.with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>);
            runtime.notifiers.push(notifier);
        }
        if let Some(store) = store {
            job = job.with_history_store(Arc::clone(store));
        }
        runtime.jobs.push(job);
    }
    Ok(runtime)
}

/// Load durable history into each job's memory.
pub async fn restore_history(jobs: &[Job]) {
    for job in jobs {
        job.restore_history().await;
    }
}
