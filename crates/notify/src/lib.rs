//! Job notifications: Slack, generic webhooks and email.
//!
//! Formatters are pure functions of the lifecycle event, the target config,
//! the job definition and (when there is one) the invocation record.
//! [`JobNotifier`] queues the formatted messages on a retry queue so a slow
//! or failing target never holds up the job.

pub mod email;
pub mod error;
pub mod notifier;
pub mod slack;
pub mod webhook;

pub use {
    email::{EmailMessage, EmailSender, SendmailSender},
    error::{Error, Result},
    notifier::{JobNotifier, Notification, Senders, Targets},
    slack::{SlackMessage, SlackSender},
    webhook::{Webhook, WebhookSender},
};

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use {
        chrono::{Duration, Utc},
        jobkit_cron::{
            InvocationRecord, InvocationStatus, JobDefinition, OutputBuffer, Parameters,
            Schedule, action,
        },
    };

    pub fn definition(name: &str) -> JobDefinition {
        JobDefinition::new(
            name,
            Schedule::OnDemand,
            action(|_| async { Ok(()) }),
        )
    }

    /// A finished record that took 1.5s.
    pub fn record(status: InvocationStatus, error: Option<&str>) -> InvocationRecord {
        let started = Utc::now() - Duration::seconds(10);
        InvocationRecord {
            id: "inv-1".into(),
            job_name: "backup".into(),
            started,
            complete: Some(started + Duration::milliseconds(1_500)),
            status,
            error: error.map(str::to_string),
            parameters: Parameters::new(),
            output: OutputBuffer::new(),
        }
    }
}
