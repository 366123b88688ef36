mod jobs;
mod validate_commands;

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::{Context, Result, bail},
    clap::{Parser, Subcommand},
    jobkit_config::{HistoryBackend, JobConfig, JobkitConfig},
    jobkit_cron::{InvocationStatus, JobManager, Parameters, parse::format_duration},
    jobkit_gateway::AppState,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "jobkit", version, about = "jobkit: recurring jobs with a management API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: jobkit.{toml,yaml,yml,json} in ./ or ~/.config/jobkit/).
    #[arg(short = 'f', long, global = true, env = "JOBKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Management server address (overrides config value).
    #[arg(long)]
    bind: Option<String>,
    /// Run jobs without the management server.
    #[arg(long)]
    disable_server: bool,
    /// Title shown by the management server.
    #[arg(long)]
    title: Option<String>,

    // Default job, built from the trailing command.
    /// Name of the default job.
    #[arg(long, default_value = "default")]
    name: String,
    /// Schedule of the default job; empty runs it on demand only.
    #[arg(long, default_value = "")]
    schedule: String,
    /// Timeout of the default job, e.g. `30s` or `1h30m`.
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
    /// How long stopping waits for the default job to exit.
    #[arg(long, value_parser = parse_duration)]
    shutdown_grace_period: Option<Duration>,
    /// Label of the default job, as `key=value`. Repeatable.
    #[arg(long = "label", value_parser = parse_key_val)]
    labels: Vec<(String, String)>,

    /// Keep no history for the default job.
    #[arg(long)]
    history_disabled: bool,
    /// Persist history as JSON files under this directory.
    #[arg(long)]
    history_path: Option<PathBuf>,
    /// Records kept for the default job; `0` keeps any number.
    #[arg(long)]
    history_max_count: Option<usize>,
    /// Oldest record kept for the default job, e.g. `7d`.
    #[arg(long, value_parser = parse_duration)]
    history_max_age: Option<Duration>,

    /// Do not expand `$VAR` from the environment in the default job's arguments.
    #[arg(long)]
    skip_expand_env: bool,
    /// Do not capture the default job's output.
    #[arg(long)]
    discard_output: bool,
    /// Do not log the default job's output.
    #[arg(long)]
    hide_output: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "JOBKIT_LOG", default_value = "info")]
    log_level: String,
    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Command of the default job.
    #[arg(last = true)]
    exec: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a configured job once and exit; the exit status is 1 on failure.
    Run {
        job: String,
        /// Invocation parameter, as `NAME=value`. Repeatable.
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Validate the configuration file and report errors/warnings.
    Validate {
        /// Show informational diagnostics too.
        #[arg(long)]
        verbose: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{s}`")),
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    jobkit_cron::parse::parse_duration(s).map_err(|e| e.to_string())
}

impl Cli {
    /// Layer command-line overrides over the loaded config.
    fn apply(&self, config: &mut JobkitConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind.clone_from(bind);
        }
        if self.disable_server {
            config.server.disabled = true;
        }
        if let Some(title) = &self.title {
            config.title = Some(title.clone());
        }
        if let Some(path) = &self.history_path {
            config.history = HistoryBackend::File { path: path.clone() };
        }
        if let Some(job) = self.default_job() {
            config.jobs.push(job);
        }
    }

    /// The job described by the trailing command, if there is one.
    fn default_job(&self) -> Option<JobConfig> {
        if self.exec.is_empty() {
            return None;
        }
        let mut job = JobConfig {
            name: self.name.clone(),
            schedule: self.schedule.clone(),
            exec: self.exec.clone(),
            timeout_secs: self.timeout.map_or(0, |d| d.as_secs()),
            shutdown_grace_period_secs: self.shutdown_grace_period.map_or(0, |d| d.as_secs()),
            labels: self.labels.iter().cloned().collect(),
            ..Default::default()
        };
        job.history.disabled = self.history_disabled;
        job.history.max_count = self.history_max_count;
        job.history.max_age_secs = self.history_max_age.map_or(0, |d| d.as_secs());
        job.shell.skip_expand_env = self.skip_expand_env;
        job.shell.discard_output = self.discard_output;
        job.shell.hide_output = self.hide_output;
        Some(job)
    }

    fn load_config(&self) -> Result<JobkitConfig> {
        let mut config = match &self.config {
            Some(path) => jobkit_config::load_config(path)?,
            None => match jobkit_config::discover_and_load()? {
                Some((path, config)) => {
                    info!(path = %path.display(), "loaded config");
                    config
                },
                None => JobkitConfig::default(),
            },
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[cfg(feature = "metrics")]
fn init_metrics(config: &JobkitConfig) -> Result<jobkit_metrics::MetricsHandle> {
    jobkit_metrics::init_metrics(jobkit_metrics::MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: vec![("service".into(), config.title_or_default().to_string())],
    })
}

/// Run every configured job on its schedule until Ctrl-C.
async fn serve(config: JobkitConfig) -> Result<()> {
    if config.jobs.is_empty() {
        bail!("no jobs configured: add [[jobs]] to the config or pass a command after --");
    }
    #[cfg(feature = "metrics")]
    let metrics_handle = init_metrics(&config)?;

    let store = jobs::history_store(&config.history).await?;
    let jobs::Runtime { jobs, notifiers } = jobs::build(&config, store.as_ref())?;
    jobs::restore_history(&jobs).await;

    let manager = Arc::new(JobManager::new());
    manager.load_jobs(jobs)?;
    for notifier in &notifiers {
        notifier.start();
    }
    manager.start_async();

    let shutdown = CancellationToken::new();
    let mut server: Option<JoinHandle<Result<()>>> = if config.server.disabled {
        info!("management server disabled");
        None
    } else {
        let state = AppState::new(Arc::clone(&manager), config.title_or_default());
        #[cfg(feature = "metrics")]
        let state = state.with_metrics_handle(metrics_handle);
        let bind = config.server.bind.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            jobkit_gateway::start_server(&bind, state, shutdown).await
        }))
    };

    let server_exit = async {
        match server.as_mut() {
            Some(task) => task.await.unwrap_or_else(|e| Err(e.into())),
            None => std::future::pending().await,
        }
    };
    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupted, shutting down");
            None
        },
        result = server_exit => Some(result),
    };
    if server_result.is_some() {
        server = None;
    }

    shutdown.cancel();
    if let Err(e) = manager.stop().await {
        warn!(error = %e, "jobs did not stop cleanly");
    }
    for notifier in &notifiers {
        notifier.stop().await;
    }
    if let Some(task) = server {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "management server stopped with an error"),
            Err(e) => warn!(error = %e, "management server task failed"),
            Ok(Ok(())) => {},
        }
    }

    match server_result {
        Some(Err(e)) => Err(e.context("management server failed")),
        Some(Ok(())) => {
            warn!("management server exited");
            Ok(())
        },
        None => Ok(()),
    }
}

/// Run `name` once. Returns whether it succeeded.
async fn run_once(config: JobkitConfig, name: &str, parameters: Parameters) -> Result<bool> {
    let store = jobs::history_store(&config.history).await?;
    let jobs::Runtime { jobs, notifiers } = jobs::build(&config, store.as_ref())?;
    jobs::restore_history(&jobs).await;

    let manager = JobManager::new();
    manager.load_jobs(jobs)?;
    let scheduler = manager.job(name)?;
    for notifier in &notifiers {
        notifier.start();
    }

    let params = (!parameters.is_empty()).then_some(&parameters);
    let invocation = scheduler.run_async(&CancellationToken::new(), params)?;
    info!(job = %name, invocation = %invocation.id(), "running");
    tokio::select! {
        () = invocation.wait() => {},
        _ = tokio::signal::ctrl_c() => {
            warn!(job = %name, "interrupted, cancelling");
            scheduler.cancel().await?;
            invocation.wait().await;
        },
    }

    let record = invocation.record();
    for notifier in &notifiers {
        notifier.stop().await;
    }
    let elapsed = format_duration(record.elapsed());
    match &record.error {
        Some(e) => error!(job = %name, status = record.status.as_str(), %elapsed, error = %e, "run failed"),
        None => info!(job = %name, status = record.status.as_str(), %elapsed, "run finished"),
    }
    Ok(record.status == InvocationStatus::Success)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match &cli.command {
        Some(Commands::Validate { verbose }) => {
            validate_commands::check(cli.config.as_deref(), *verbose);
            Ok(())
        },
        Some(Commands::Run { job, params }) => {
            let config = cli.load_config()?;
            let parameters = params.iter().cloned().collect();
            if !run_once(config, job, parameters).await? {
                std::process::exit(1);
            }
            Ok(())
        },
        None => {
            info!(version = env!("CARGO_PKG_VERSION"), "jobkit starting");
            serve(cli.load_config()?).await
        },
    }
}
