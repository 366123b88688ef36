//! Slack incoming-webhook messages.

use {
    jobkit_config::SlackConfig,
    jobkit_cron::{InvocationRecord, JobDefinition, LifecycleEvent, parse::format_duration},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::error::{Error, Result};

const COLOR_ERROR: &str = "#ff0000";
const COLOR_OK: &str = "#00ff00";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_emoji: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackAttachment {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl SlackAttachment {
    fn new(text: impl Into<String>, color: Option<&str>) -> Self {
        Self {
            text: text.into(),
            color: color.map(str::to_string),
        }
    }
}

/// Build the message for `event`, starting from the configured defaults.
#[must_use]
pub fn format_message(
    event: LifecycleEvent,
    defaults: &SlackConfig,
    definition: &JobDefinition,
    record: Option<&InvocationRecord>,
) -> SlackMessage {
    let mut message = SlackMessage {
        channel: defaults.channel.clone(),
        username: defaults.username.clone(),
        icon_emoji: defaults.icon_emoji.clone(),
        ..Default::default()
    };

    let headline = format!("{} {}", definition.name, event.flag());
    match record.and_then(|r| r.error.as_deref()) {
        Some(error) => {
            message
                .attachments
                .push(SlackAttachment::new(headline, Some(COLOR_ERROR)));
            message.attachments.push(SlackAttachment::new(
                format!("error: {error}"),
                Some(COLOR_ERROR),
            ));
        },
        None => message
            .attachments
            .push(SlackAttachment::new(headline, Some(COLOR_OK))),
    }

    if let Some(record) = record.filter(|r| r.complete.is_some()) {
        message.attachments.push(SlackAttachment::new(
            format!("{} elapsed", format_duration(record.elapsed())),
            None,
        ));
    }

    message
}

/// Posts messages to one incoming-webhook URL.
#[derive(Clone)]
pub struct SlackSender {
    client: reqwest::Client,
    webhook_url: Secret<String>,
}

impl SlackSender {
    pub fn new(client: reqwest::Client, webhook_url: Secret<String>) -> Self {
        Self {
            client,
            webhook_url,
        }
    }

    pub async fn send(&self, message: &SlackMessage) -> Result<()> {
        let resp = self
            .client
            .post(self.webhook_url.expose_secret())
            .json(message)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                target: "slack",
                status,
                body,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SlackSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSender")
            .field("webhook_url", &"[REDACTED]")
            .finish()
    }
}
