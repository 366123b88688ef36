//! Generic HTTP webhook notifications.

use std::collections::BTreeMap;

use {
    jobkit_config::WebhookConfig,
    jobkit_cron::{InvocationRecord, JobDefinition, LifecycleEvent, parse::format_duration},
    serde::{Deserialize, Serialize},
};

use crate::error::{Error, Result};

/// A fully rendered request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl Webhook {
    /// No url, nothing to send.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.url.is_empty()
    }
}

/// Render `config` for `event`, substituting `${job}`, `${flag}`,
/// `${status}`, `${id}`, `${elapsed}` and `${error}` in the body.
#[must_use]
pub fn format_webhook(
    event: LifecycleEvent,
    config: &WebhookConfig,
    definition: &JobDefinition,
    record: Option<&InvocationRecord>,
) -> Webhook {
    let method = config
        .method
        .as_deref()
        .filter(|m| !m.is_empty())
        .unwrap_or("GET")
        .to_ascii_uppercase();

    let body = config.body.as_ref().map(|template| {
        let status = record.map(|r| r.status.as_str()).unwrap_or_default();
        let id = record.map(|r| r.id.as_str()).unwrap_or_default();
        let elapsed = record
            .filter(|r| r.complete.is_some())
            .map(|r| format_duration(r.elapsed()))
            .unwrap_or_default();
        let error = record.and_then(|r| r.error.as_deref()).unwrap_or_default();
        template
            .replace("${job}", &definition.name)
            .replace("${flag}", event.flag())
            .replace("${status}", status)
            .replace("${id}", id)
            .replace("${elapsed}", &elapsed)
            .replace("${error}", error)
    });

    Webhook {
        method,
        url: config.url.clone(),
        headers: config.headers.clone(),
        body,
    }
}

/// Sends rendered webhooks.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn send(&self, webhook: &Webhook) -> Result<()> {
        let method = reqwest::Method::from_bytes(webhook.method.as_bytes()).map_err(|_| {
            Error::InvalidMethod {
                method: webhook.method.clone(),
            }
        })?;

        let mut req = self.client.request(method, &webhook.url);
        for (name, value) in &webhook.headers {
            req = req.header(name, value);
        }
        if let Some(body) = &webhook.body {
            req = req.body(body.clone());
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                target: "webhook",
                status,
                body,
            });
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::tests::{definition, record},
        jobkit_cron::InvocationStatus,
    };

    #[test]
    fn defaults_to_get_without_body() {
        let config = WebhookConfig {
            url: "http://hooks.local/x".into(),
            ..Default::default()
        };
        let hook = format_webhook(
            LifecycleEvent::Begin,
            &config,
            &definition("backup"),
            None,
        );
        assert_eq!(hook.method, "GET");
        assert_eq!(hook.body, None);
        assert!(!hook.is_zero());
        assert!(Webhook::default().is_zero());
    }

    #[test]
    fn body_template_is_rendered() {
        let config = WebhookConfig {
            method: Some("post".into()),
            url: "http://hooks.local/x".into(),
            headers: BTreeMap::from([("X-Token".to_string(), "t".to_string())]),
            body: Some(
                r#"{"job":"${job}","flag":"${flag}","status":"${status}","id":"${id}","elapsed":"${elapsed}","error":"${error}"}"#
                    .into(),
            ),
        };
        let record = record(InvocationStatus::Errored, Some("boom"));
        let hook = format_webhook(
            LifecycleEvent::Errored,
            &config,
            &definition("backup"),
            Some(&record),
        );

        assert_eq!(hook.method, "POST");
        assert_eq!(hook.headers["X-Token"], "t");
        let body: serde_json::Value = serde_json::from_str(hook.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["job"], "backup");
        assert_eq!(body["flag"], "job.errored");
        assert_eq!(body["status"], "errored");
        assert_eq!(body["id"], record.id.as_str());
        assert_eq!(body["elapsed"], "1s500ms");
        assert_eq!(body["error"], "boom");
    }

    #[tokio::test]
    async fn sender_reports_non_success_status() {
        use axum::{Router, http::StatusCode, routing::post};

        let app = Router::new()
            .route("/ok", post(|body: String| async move {
                assert_eq!(body, "hello");
                StatusCode::NO_CONTENT
            }))
            .route("/fail", post(|| async { (StatusCode::BAD_GATEWAY, "nope") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let sender = WebhookSender::new(reqwest::Client::new());
        let hook = |path: &str| Webhook {
            method: "POST".into(),
            url: format!("http://{addr}{path}"),
            headers: BTreeMap::new(),
            body: Some("hello".into()),
        };

        sender.send(&hook("/ok")).await.unwrap();
        let err = sender.send(&hook("/fail")).await.unwrap_err();
        assert!(matches!(err, Error::Status { status: 502, ref body, .. } if body == "nope"));

        let bad = Webhook {
            method: "NOT A METHOD".into(),
            ..hook("/ok")
        };
        assert!(matches!(
            sender.send(&bad).await.unwrap_err(),
            Error::InvalidMethod { .. }
        ));
    }
}
