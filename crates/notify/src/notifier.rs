//! Per-job notifier: formats enabled events and delivers them through a
//! retry queue.

use std::sync::Arc;

use {
    async_trait::async_trait,
    jobkit_config::{EmailConfig, SlackConfig, WebhookConfig},
    jobkit_cron::{
        InvocationRecord, JobDefinition, LifecycleEvent, Notifier, RetryQueue,
        retry::constant_wait,
    },
    secrecy::Secret,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use jobkit_metrics::{counter, labels, notify as notify_metrics};

use crate::{
    email::{self, EmailMessage, EmailSender, SendmailSender},
    slack::{self, SlackMessage, SlackSender},
    webhook::{self, Webhook, WebhookSender},
};

/// One message waiting for delivery.
#[derive(Debug, Clone)]
pub enum Notification {
    Slack {
        webhook_url: Secret<String>,
        message: SlackMessage,
    },
    Webhook(Webhook),
    Email(EmailMessage),
}

impl Notification {
    #[must_use]
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Slack { .. } => "slack",
            Self::Webhook(_) => "webhook",
            Self::Email(_) => "email",
        }
    }
}

/// Where a job's notifications go. Unset targets are skipped.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    pub slack: Option<SlackConfig>,
    pub webhook: Option<WebhookConfig>,
    pub email: Option<EmailConfig>,
}

impl Targets {
    /// Job-level overrides layered over the shared defaults.
    #[must_use]
    pub fn resolve(
        slack_defaults: &SlackConfig,
        email_defaults: &EmailConfig,
        slack: Option<&SlackConfig>,
        webhook: Option<&WebhookConfig>,
        email: Option<&EmailConfig>,
    ) -> Self {
        let slack = slack.map_or_else(|| slack_defaults.clone(), |s| s.or(slack_defaults));
        let email = email.map_or_else(|| email_defaults.clone(), |e| e.or(email_defaults));
        Self {
            slack: slack.is_configured().then_some(slack),
            webhook: webhook.filter(|w| !w.url.is_empty()).cloned(),
            email: email.is_configured().then_some(email),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slack.is_none() && self.webhook.is_none() && self.email.is_none()
    }

    fn format(
        &self,
        event: LifecycleEvent,
        definition: &JobDefinition,
        record: Option<&InvocationRecord>,
    ) -> Vec<Notification> {
        let mut out = Vec::new();
        if let Some((config, webhook_url)) = self
            .slack
            .as_ref()
            .and_then(|c| c.webhook_url.as_ref().map(|url| (c, url)))
        {
            out.push(Notification::Slack {
                webhook_url: webhook_url.clone(),
                message: slack::format_message(event, config, definition, record),
            });
        }
        if let Some(config) = &self.webhook {
            let hook = webhook::format_webhook(event, config, definition, record);
            if !hook.is_zero() {
                out.push(Notification::Webhook(hook));
            }
        }
        if let Some(config) = &self.email {
            out.push(Notification::Email(email::format_email(
                event, config, definition, record,
            )));
        }
        out
    }
}

/// Transports shared by every notifier.
#[derive(Clone)]
pub struct Senders {
    pub http: reqwest::Client,
    pub email: Arc<dyn EmailSender>,
}

impl Senders {
    pub fn new(http: reqwest::Client, email: Arc<dyn EmailSender>) -> Self {
        Self { http, email }
    }

    async fn deliver(&self, notification: Notification) -> anyhow::Result<()> {
        match notification {
            Notification::Slack {
                webhook_url,
                message,
            } => {
                SlackSender::new(self.http.clone(), webhook_url)
                    .send(&message)
                    .await?
            },
            Notification::Webhook(hook) => WebhookSender::new(self.http.clone()).send(&hook).await?,
            Notification::Email(message) => self.email.send(&message).await?,
        }
        Ok(())
    }
}

impl Default for Senders {
    fn default() -> Self {
        Self::new(reqwest::Client::new(), Arc::new(SendmailSender::default()))
    }
}

/// [`Notifier`] for one job.
pub struct JobNotifier {
    targets: Targets,
    queue: Arc<RetryQueue<Notification>>,
}

impl JobNotifier {
    /// The queue takes its attempt limit and retry wait from `definition`.
    pub fn new(definition: &JobDefinition, targets: Targets, senders: Senders) -> Self {
        let senders = Arc::new(senders);
        let job = definition.name.clone();
        let policy = &definition.notifications;
        let queue = RetryQueue::from_fn(format!("notify:{job}"), move |notification: Notification| {
            let senders = Arc::clone(&senders);
            let job = job.clone();
            async move {
                let channel = notification.channel();
                let result = senders.deliver(notification).await;
                #[cfg(feature = "metrics")]
                {
                    let name = if result.is_ok() {
                        notify_metrics::DELIVERED_TOTAL
                    } else {
                        notify_metrics::ERRORS_TOTAL
                    };
                    counter!(name, labels::CHANNEL => channel).increment(1);
                }
                if result.is_ok() {
                    debug!(job = %job, channel, "notification delivered");
                }
                result
            }
        })
        .with_parallelism(1)
        .with_max_attempts(policy.max_attempts)
        .with_wait_provider(constant_wait(policy.retry_wait));

        Self {
            targets,
            queue: Arc::new(queue),
        }
    }

    #[must_use]
    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    /// Spawn the delivery workers. Call once.
    pub fn start(&self) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            if let Err(e) = queue.start().await {
                warn!(queue = %queue.name(), error = %e, "notification queue failed to start");
            }
        });
    }

    /// Stop delivering; in-flight attempts finish first.
    pub async fn stop(&self) {
        self.queue.stop().await;
    }
}

#[async_trait]
impl Notifier for JobNotifier {
    async fn notify(
        &self,
        event: LifecycleEvent,
        definition: &JobDefinition,
        record: Option<&InvocationRecord>,
    ) -> jobkit_cron::Result<()> {
        for notification in self.targets.format(event, definition, record) {
            #[cfg(feature = "metrics")]
            counter!(
                notify_metrics::ENQUEUED_TOTAL,
                labels::CHANNEL => notification.channel(),
                labels::FLAG => event.flag()
            )
            .increment(1);
            debug!(
                job = %definition.name,
                flag = event.flag(),
                channel = notification.channel(),
                "queueing notification"
            );
            self.queue.add(notification).await?;
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::Result,
            tests::{definition, record},
        },
        jobkit_cron::InvocationStatus,
        std::{
            sync::{
                Mutex,
                atomic::{AtomicU32, Ordering},
            },
            time::Duration,
        },
    };

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<EmailMessage>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EmailSender for RecordingSender {
        async fn send(&self, message: &EmailMessage) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(crate::Error::Sendmail { status: 75 });
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn email_targets() -> Targets {
        Targets {
            email: Some(EmailConfig {
                to: vec!["ops@example.com".into()],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn wait_for(sender: &RecordingSender, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sender.sent.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("notification delivered");
    }

    #[test]
    fn resolve_layers_job_overrides_over_defaults() {
        let defaults = SlackConfig {
            webhook_url: Some(Secret::new("https://hooks.slack.test/T".into())),
            channel: Some("#ops".into()),
            ..Default::default()
        };
        let job = SlackConfig {
            channel: Some("#backups".into()),
            ..Default::default()
        };
        let targets = Targets::resolve(
            &defaults,
            &EmailConfig::default(),
            Some(&job),
            Some(&WebhookConfig::default()),
            None,
        );
        let slack = targets.slack.unwrap();
        assert_eq!(slack.channel.as_deref(), Some("#backups"));
        assert!(slack.is_configured());
        assert!(targets.webhook.is_none());
        assert!(targets.email.is_none());

        assert!(
            Targets::resolve(
                &SlackConfig::default(),
                &EmailConfig::default(),
                None,
                None,
                None
            )
            .is_empty()
        );
    }

    #[tokio::test]
    async fn delivers_enabled_events_with_retries() {
        let sender = Arc::new(RecordingSender {
            failures_left: AtomicU32::new(2),
            ..Default::default()
        });
        let mut definition = definition("backup");
        definition.notifications.retry_wait = Duration::from_millis(1);
        let notifier = JobNotifier::new(
            &definition,
            email_targets(),
            Senders::new(reqwest::Client::new(), Arc::clone(&sender) as Arc<dyn EmailSender>),
        );
        notifier.start();

        let record = record(InvocationStatus::Errored, Some("boom"));
        notifier
            .notify(LifecycleEvent::Errored, &definition, Some(&record))
            .await
            .unwrap();
        wait_for(&sender, 1).await;
        notifier.stop().await;

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "backup :: job.errored");
        assert_eq!(sender.failures_left.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let sender = Arc::new(RecordingSender {
            failures_left: AtomicU32::new(u32::MAX),
            ..Default::default()
        });
        let mut definition = definition("backup");
        definition.notifications.max_attempts = 3;
        definition.notifications.retry_wait = Duration::from_millis(1);
        let notifier = JobNotifier::new(
            &definition,
            email_targets(),
            Senders::new(reqwest::Client::new(), Arc::clone(&sender) as Arc<dyn EmailSender>),
        );
        notifier.start();
        notifier
            .notify(LifecycleEvent::Enabled, &definition, None)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while sender.failures_left.load(Ordering::SeqCst) > u32::MAX - 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        notifier.stop().await;

        assert_eq!(sender.failures_left.load(Ordering::SeqCst), u32::MAX - 3);
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn formats_one_notification_per_target() {
        let targets = Targets {
            slack: Some(SlackConfig {
                webhook_url: Some(Secret::new("https://hooks.slack.test/T".into())),
                ..Default::default()
            }),
            webhook: Some(WebhookConfig {
                url: "http://hooks.local".into(),
                ..Default::default()
            }),
            ..email_targets()
        };
        let channels: Vec<_> = targets
            .format(LifecycleEvent::Broken, &definition("backup"), None)
            .iter()
            .map(Notification::channel)
            .collect();
        assert_eq!(channels, vec!["slack", "webhook", "email"]);
    }
}
