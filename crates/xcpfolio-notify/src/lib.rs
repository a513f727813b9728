//! Best-effort operator notifications (spec.md §7: "notifications are
//! best-effort and never influence control flow"). A missing webhook URL is
//! not an error — the no-op [`NullNotifier`] is the default.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Success,
    Critical,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);

    async fn warning(&self, message: &str) {
        self.notify(Severity::Warning, message).await;
    }

    async fn success(&self, message: &str) {
        self.notify(Severity::Success, message).await;
    }

    async fn critical(&self, message: &str) {
        self.notify(Severity::Critical, message).await;
    }
}

pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _severity: Severity, _message: &str) {}
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    severity: Severity,
    message: &'a str,
}

pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        let payload = WebhookPayload { severity, message };
        if let Err(error) = self.http.post(&self.url).json(&payload).send().await {
            warn!(%error, url = self.url, "failed to deliver notification");
        }
    }
}
