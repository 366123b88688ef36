//! Email notifications, delivered through a sendmail-compatible binary.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use {
    async_trait::async_trait,
    jobkit_config::EmailConfig,
    jobkit_cron::{InvocationRecord, JobDefinition, LifecycleEvent, parse::format_duration},
    serde::{Deserialize, Serialize},
    tokio::{io::AsyncWriteExt, process::Command},
    tracing::debug,
};

use crate::error::{Error, Result};

/// Output beyond this many trailing bytes is cut from email bodies.
pub const DEFAULT_MAX_LOG_BYTES: usize = 10 * 1024;

pub const DEFAULT_SENDMAIL_PATH: &str = "/usr/sbin/sendmail";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

impl EmailMessage {
    /// Render as an RFC 5322 message with a multipart/alternative body.
    #[must_use]
    pub fn to_rfc5322(&self) -> String {
        let boundary = format!("jobkit-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let mut out = String::new();
        if let Some(from) = &self.from {
            out.push_str(&format!("From: {from}\r\n"));
        }
        for (header, list) in [("To", &self.to), ("Cc", &self.cc), ("Bcc", &self.bcc)] {
            if !list.is_empty() {
                out.push_str(&format!("{header}: {}\r\n", list.join(", ")));
            }
        }
        out.push_str(&format!("Subject: {}\r\n", self.subject));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str(&format!(
            "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
        ));
        for (mime, body) in [("text/plain", &self.text_body), ("text/html", &self.html_body)] {
            out.push_str(&format!("--{boundary}\r\n"));
            out.push_str(&format!("Content-Type: {mime}; charset=utf-8\r\n\r\n"));
            out.push_str(&body.replace('\n', "\r\n"));
            out.push_str("\r\n");
        }
        out.push_str(&format!("--{boundary}--\r\n"));
        out
    }
}

/// The last `max_bytes` of `text`, cut on a char boundary.
fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build the message for `event`. Subject is `"<job> :: <flag>"`.
#[must_use]
pub fn format_email(
    event: LifecycleEvent,
    config: &EmailConfig,
    definition: &JobDefinition,
    record: Option<&InvocationRecord>,
) -> EmailMessage {
    let name = &definition.name;
    let status = record.map_or("unknown", |r| r.status.as_str());
    let elapsed = record
        .filter(|r| r.complete.is_some())
        .map(|r| format_duration(r.elapsed()));
    let error = record.and_then(|r| r.error.as_deref());
    let output = record
        .filter(|r| !r.output.is_empty())
        .map(|r| r.output.contents());
    let output = output
        .as_deref()
        .map(|o| tail(o, DEFAULT_MAX_LOG_BYTES));

    let mut text_body = format!("{name} {status}\n");
    if let Some(elapsed) = &elapsed {
        text_body.push_str(&format!("Elapsed: {elapsed}\n"));
    }
    if let Some(error) = error {
        text_body.push_str(&format!("Error: {error}\n"));
    }
    if let Some(output) = output {
        text_body.push_str(&format!("Output:\n{output}\n"));
    }

    let title = escape_html(&format!("{name} {status}"));
    let mut html_body = format!(
        "<html>\n<head>\n<title>{title}</title>\n<meta http-equiv=\"Content-Type\" \
         content=\"text/html; charset=UTF-8\" />\n</head>\n<body style=\"margin:0;padding:20px;\
         font-family:sans-serif\">\n<h3>{title}</h3>\n"
    );
    if let Some(elapsed) = &elapsed {
        html_body.push_str(&format!("<p>Elapsed: {elapsed}</p>\n"));
    }
    if let Some(error) = error {
        html_body.push_str(&format!("<h4>Error</h4>\n<pre>{}</pre>\n", escape_html(error)));
    }
    if let Some(output) = output {
        html_body.push_str(&format!("<h4>Output</h4>\n<pre>{}</pre>\n", escape_html(output)));
    }
    html_body.push_str("</body>\n</html>\n");

    EmailMessage {
        from: config.from.clone(),
        to: config.to.clone(),
        cc: config.cc.clone(),
        bcc: config.bcc.clone(),
        subject: format!("{name} :: {}", event.flag()),
        text_body,
        html_body,
    }
}

/// Delivers email messages.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Pipes messages to `sendmail -t -i`.
#[derive(Debug, Clone)]
pub struct SendmailSender {
    path: PathBuf,
}

impl SendmailSender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for SendmailSender {
    fn default() -> Self {
        Self::new(DEFAULT_SENDMAIL_PATH)
    }
}

#[async_trait]
impl EmailSender for SendmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let mut child = Command::new(&self.path)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.to_rfc5322().as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::Sendmail {
                status: status.code().unwrap_or(-1),
            });
        }
        debug!(to = %message.to.join(","), subject = %message.subject, "sent email notification");
        Ok(())
    }
}
