//! Config schema types (server, history backend, notification targets, jobs).
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use {
    jobkit_cron::{HistoryPolicy, NotificationPolicy, Parameter, history::DEFAULT_MAX_COUNT},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobkitConfig {
    /// Shown by the management server; defaults to "jobkit".
    pub title: Option<String>,
    pub server: ServerConfig,
    pub history: HistoryBackend,
    /// Slack defaults shared by every job.
    pub slack: SlackConfig,
    /// Email defaults shared by every job.
    pub email: EmailConfig,
    pub metrics: MetricsConfig,
    pub jobs: Vec<JobConfig>,
}

impl JobkitConfig {
    #[must_use]
    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().unwrap_or("jobkit")
    }
}

/// Management server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on. Defaults to "127.0.0.1:8080".
    pub bind: String,
    /// Run jobs without serving the management API.
    pub disabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            disabled: false,
        }
    }
}

/// Where invocation history is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum HistoryBackend {
    /// Process memory only; lost on restart.
    #[default]
    Memory,
    /// One JSON file per job under `path`.
    File { path: PathBuf },
    /// A sqlx SQLite database, e.g. `sqlite://jobkit.db?mode=rwc`.
    Sqlite { url: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Record metrics and serve `/metrics` when built with Prometheus support.
    pub enabled: bool,
}

/// Slack incoming-webhook target. Job-level values override the defaults.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub webhook_url: Option<Secret<String>>,
    pub channel: Option<String>,
    pub username: Option<String>,
    pub icon_emoji: Option<String>,
}

impl SlackConfig {
    /// `self` with every unset field filled from `defaults`.
    #[must_use]
    pub fn or(&self, defaults: &Self) -> Self {
        Self {
            webhook_url: self
                .webhook_url
                .clone()
                .or_else(|| defaults.webhook_url.clone()),
            channel: self.channel.clone().or_else(|| defaults.channel.clone()),
            username: self.username.clone().or_else(|| defaults.username.clone()),
            icon_emoji: self
                .icon_emoji
                .clone()
                .or_else(|| defaults.icon_emoji.clone()),
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.webhook_url
            .as_ref()
            .is_some_and(|url| !url.expose_secret().is_empty())
    }
}

impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig")
            .field("webhook_url", &self.webhook_url.as_ref().map(|_| "[REDACTED]"))
            .field("channel", &self.channel)
            .field("username", &self.username)
            .field("icon_emoji", &self.icon_emoji)
            .finish()
    }
}

/// Email notification target, delivered through a sendmail-compatible binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Defaults to `/usr/sbin/sendmail`.
    pub sendmail_path: Option<PathBuf>,
}

impl EmailConfig {
    /// `self` with unset fields (and empty recipient lists) taken from
    /// `defaults`.
    #[must_use]
    pub fn or(&self, defaults: &Self) -> Self {
        let pick = |own: &Vec<String>, fallback: &Vec<String>| {
            if own.is_empty() {
                fallback.clone()
            } else {
                own.clone()
            }
        };
        Self {
            from: self.from.clone().or_else(|| defaults.from.clone()),
            to: pick(&self.to, &defaults.to),
            cc: pick(&self.cc, &defaults.cc),
            bcc: pick(&self.bcc, &defaults.bcc),
            sendmail_path: self
                .sendmail_path
                .clone()
                .or_else(|| defaults.sendmail_path.clone()),
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.to.is_empty()
    }
}

/// An HTTP request sent on each notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Defaults to GET.
    pub method: Option<String>,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Body template; `${job}`, `${flag}`, `${status}`, `${id}`,
    /// `${elapsed}` and `${error}` are substituted.
    pub body: Option<String>,
}

/// A single job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub name: String,
    pub description: String,
    /// Cron expression or `@every`/`@daily`-style shorthand. Empty means
    /// on-demand only.
    pub schedule: String,
    /// Program and arguments.
    pub exec: Vec<String>,
    /// `0` means no timeout.
    pub timeout_secs: u64,
    pub shutdown_grace_period_secs: u64,
    pub labels: BTreeMap<String, String>,
    pub parameters: Vec<ParameterConfig>,
    pub disabled: bool,
    pub history: JobHistoryConfig,
    pub notifications: NotificationsConfig,
    pub shell: ShellConfig,
}

impl JobConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    #[must_use]
    pub fn history_policy(&self) -> HistoryPolicy {
        HistoryPolicy {
            disabled: self.history.disabled,
            persistence_disabled: self.history.persistence_disabled,
            max_count: self.history.max_count.unwrap_or(DEFAULT_MAX_COUNT),
            max_age: Duration::from_secs(self.history.max_age_secs),
        }
    }

    #[must_use]
    pub fn notification_policy(&self) -> NotificationPolicy {
        let n = &self.notifications;
        let defaults = NotificationPolicy::default();
        NotificationPolicy {
            on_begin: n.on_begin.unwrap_or(defaults.on_begin),
            on_complete: n.on_complete.unwrap_or(defaults.on_complete),
            on_success: n.on_success.unwrap_or(defaults.on_success),
            on_error: n.on_error.unwrap_or(defaults.on_error),
            on_cancellation: n.on_cancellation.unwrap_or(defaults.on_cancellation),
            on_broken: n.on_broken.unwrap_or(defaults.on_broken),
            on_fixed: n.on_fixed.unwrap_or(defaults.on_fixed),
            on_enabled: n.on_enabled.unwrap_or(defaults.on_enabled),
            on_disabled: n.on_disabled.unwrap_or(defaults.on_disabled),
            max_attempts: n.max_retries.unwrap_or(defaults.max_attempts),
            retry_wait: n
                .retry_wait_secs
                .map_or(defaults.retry_wait, Duration::from_secs),
        }
    }

    #[must_use]
    pub fn declared_parameters(&self) -> Vec<Parameter> {
        self.parameters
            .iter()
            .map(|p| Parameter {
                name: p.name.clone(),
                label: p.label.clone(),
                default: p.default.clone(),
                required: p.required,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterConfig {
    pub name: String,
    pub label: Option<String>,
    pub default: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobHistoryConfig {
    pub disabled: bool,
    pub persistence_disabled: bool,
    /// Defaults to 256; `0` keeps any number.
    pub max_count: Option<usize>,
    /// `0` keeps records of any age.
    pub max_age_secs: u64,
}

/// Per-job notification toggles and target overrides. Unset toggles use
/// the defaults: errors, cancellations, broken and fixed notify.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub on_begin: Option<bool>,
    pub on_complete: Option<bool>,
    pub on_success: Option<bool>,
    pub on_error: Option<bool>,
    pub on_cancellation: Option<bool>,
    pub on_broken: Option<bool>,
    pub on_fixed: Option<bool>,
    pub on_enabled: Option<bool>,
    pub on_disabled: Option<bool>,
    /// Delivery attempts per message; `0` retries forever.
    pub max_retries: Option<u32>,
    pub retry_wait_secs: Option<u64>,
    pub webhook: Option<WebhookConfig>,
    pub slack: Option<SlackConfig>,
    pub email: Option<EmailConfig>,
}

/// How the job's command runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Do not expand `$VAR` from the process environment in arguments.
    pub skip_expand_env: bool,
    /// Do not capture output into the invocation.
    pub discard_output: bool,
    /// Do not log output lines.
    pub hide_output: bool,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_policies_use_defaults() {
        let job = JobConfig {
            name: "backup".into(),
            ..Default::default()
        };
        assert_eq!(job.history_policy(), HistoryPolicy::default());
        assert_eq!(job.notification_policy(), NotificationPolicy::default());
        assert!(job.timeout().is_zero());
    }

    #[test]
    fn job_policies_apply_overrides() {
        let job = JobConfig {
            history: JobHistoryConfig {
                max_count: Some(0),
                max_age_secs: 3600,
                ..Default::default()
            },
            notifications: NotificationsConfig {
                on_success: Some(true),
                on_error: Some(false),
                max_retries: Some(2),
                retry_wait_secs: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let history = job.history_policy();
        assert_eq!(history.max_count, 0);
        assert_eq!(history.max_age, Duration::from_secs(3600));

        let notify = job.notification_policy();
        assert!(notify.on_success);
        assert!(!notify.on_error);
        assert!(notify.on_broken);
        assert_eq!(notify.max_attempts, 2);
        assert_eq!(notify.retry_wait, Duration::from_secs(1));
    }

    #[test]
    fn slack_override_falls_back_to_defaults() {
        let defaults = SlackConfig {
            webhook_url: Some(Secret::new("https://hooks.slack.test/x".into())),
            channel: Some("#ops".into()),
            ..Default::default()
        };
        let job = SlackConfig {
            channel: Some("#backups".into()),
            ..Default::default()
        };
        let merged = job.or(&defaults);
        assert!(merged.is_configured());
        assert_eq!(merged.channel.as_deref(), Some("#backups"));
        assert!(!format!("{merged:?}").contains("hooks.slack.test"));
    }

    #[test]
    fn email_override_keeps_own_recipients() {
        let defaults = EmailConfig {
            from: Some("jobkit@example.com".into()),
            to: vec!["ops@example.com".into()],
            ..Default::default()
        };
        let job = EmailConfig {
            to: vec!["dba@example.com".into()],
            ..Default::default()
        };
        let merged = job.or(&defaults);
        assert_eq!(merged.to, vec!["dba@example.com"]);
        assert_eq!(merged.from.as_deref(), Some("jobkit@example.com"));
        assert!(!EmailConfig::default().or(&EmailConfig::default()).is_configured());
    }

    #[test]
    fn history_backend_is_tagged() {
        let cfg: JobkitConfig = toml::from_str(
            r#"
            [history]
            backend = "file"
            path = "_history"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.history, HistoryBackend::File {
            path: PathBuf::from("_history")
        });
        assert_eq!(JobkitConfig::default().history, HistoryBackend::Memory);
    }
}
