//! Status rendering and event notification for release progress.
//!
//! [`StatusRenderer`] posts a single message per release tag and then
//! updates it in place as packages progress — Slack's model for a "status
//! thread" that never spams a channel. Rendering runs detached from the
//! tick loop: a render call spawns its own retried post/update and returns
//! immediately, so a slow or rate-limited status API can never stall the
//! release tree. [`WebhookNotifier`] is a secondary, optional channel for
//! one-shot lifecycle events (release started/finished), signed the same
//! way an inbound webhook consumer would expect to verify them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use releasectl_retry::calculate_delay;
use releasectl_types::{ClientError, ReleaseState};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// A handle to a previously posted status message, opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub channel: String,
    pub ts: String,
}

/// Minimal posting/updating surface a status backend must provide.
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn post(&self, channel: &str, text: &str) -> Result<MessageHandle, ClientError>;
    async fn update(&self, handle: &MessageHandle, text: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    ts: Option<String>,
    error: Option<String>,
}

/// Slack Web API (`chat.postMessage` / `chat.update`) backed client.
pub struct SlackStatusClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl SlackStatusClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            api_base: "https://slack.com/api".to_string(),
        }
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<SlackResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/{}", self.api_base, method))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SlackResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Other(format!("failed to decode Slack response: {e}")))?;

        if !parsed.ok {
            return Err(ClientError::Other(
                parsed.error.unwrap_or_else(|| "unknown Slack API error".to_string()),
            ));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl StatusClient for SlackStatusClient {
    async fn post(&self, channel: &str, text: &str) -> Result<MessageHandle, ClientError> {
        let response = self
            .call(
                "chat.postMessage",
                serde_json::json!({ "channel": channel, "text": text }),
            )
            .await?;
        let ts = response
            .ts
            .ok_or_else(|| ClientError::Other("Slack response missing ts".to_string()))?;
        Ok(MessageHandle {
            channel: channel.to_string(),
            ts,
        })
    }

    async fn update(&self, handle: &MessageHandle, text: &str) -> Result<(), ClientError> {
        self.call(
            "chat.update",
            serde_json::json!({ "channel": handle.channel, "ts": handle.ts, "text": text }),
        )
        .await?;
        Ok(())
    }
}

/// Render release progress as human-readable text, one line per package.
pub fn render_text(state: &ReleaseState) -> String {
    let mut lines = vec![format!(
        "*Release {}* ({:?}) — {}",
        state.tag,
        state.release_type,
        match state.root_status() {
            Some(true) => "✅ succeeded",
            Some(false) => "❌ failed",
            None => "⏳ in progress",
        }
    )];

    for summary in state.package_summaries() {
        let marker = match summary.result {
            releasectl_types::PackageResult::Success => "✅",
            releasectl_types::PackageResult::Failed => "❌",
            releasectl_types::PackageResult::Skipped => "⏭️",
            releasectl_types::PackageResult::Pending => "⏳",
        };
        let mut line = format!(
            "{marker} `{}` — build: {:?}, publish: {:?}",
            summary.name, summary.build_status, summary.publish_status
        );
        if let Some(reason) = summary.blocking_reason {
            line.push_str(&format!(" ({reason})"));
        }
        lines.push(line);
    }

    lines.join("\n")
}

/// Posts one status message per tag and updates it in place thereafter.
/// Each `render` call is fire-and-forget: failures (including exhausting
/// the retry budget) are logged and never propagated, since a status
/// update is never allowed to block or fail the release itself.
pub struct StatusRenderer {
    client: Arc<dyn StatusClient>,
    channel: String,
    retry: releasectl_retry::RetryStrategyConfig,
    handle: Mutex<Option<MessageHandle>>,
    last_text: Mutex<Option<String>>,
}

impl StatusRenderer {
    pub fn new(client: Arc<dyn StatusClient>, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
            retry: releasectl_retry::RetryPolicy::Aggressive.to_config(),
            handle: Mutex::new(None),
            last_text: Mutex::new(None),
        }
    }

    /// The channel/ts of the currently-posted status message, if one has
    /// been posted yet. Handed to dispatched workflows as status-thread
    /// coordinates so they can post their own updates into the same thread.
    pub async fn current_handle(&self) -> Option<MessageHandle> {
        self.handle.lock().await.clone()
    }

    /// Render the current state, spawning detached work that posts or
    /// updates the status message with retry/backoff on transient errors.
    /// Skipped entirely if the rendered text is identical to the last
    /// successfully emitted one — a tick that didn't change any package's
    /// observable status shouldn't spam `chat.update`.
    pub fn render(self: &Arc<Self>, state: &ReleaseState) {
        let this = Arc::clone(self);
        let text = render_text(state);
        let tag = state.tag.clone();
        tokio::spawn(async move {
            if this.last_text.lock().await.as_deref() == Some(text.as_str()) {
                return;
            }
            if let Err(e) = this.render_inner(&text).await {
                tracing::warn!(tag = %tag, error = %e, "status render failed after retries; release proceeds regardless");
            }
        });
    }

    async fn render_inner(&self, text: &str) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            let existing = self.handle.lock().await.clone();
            let result = match &existing {
                Some(h) => self.client.update(h, text).await.map(|_| h.clone()),
                None => self.client.post(&self.channel, text).await,
            };

            match result {
                Ok(handle) => {
                    *self.handle.lock().await = Some(handle);
                    *self.last_text.lock().await = Some(text.to_string());
                    return Ok(());
                }
                Err(e) if e.class() == releasectl_types::ErrorClass::Transient
                    && attempt < self.retry.max_attempts =>
                {
                    let delay = calculate_delay(&self.retry, attempt);
                    tracing::debug!(attempt, ?delay, "status render transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Events that can trigger a signed webhook notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    ReleaseStarted {
        tag: String,
        package_count: usize,
    },
    PackageSucceeded {
        tag: String,
        package: String,
    },
    PackageFailed {
        tag: String,
        package: String,
        message: String,
    },
    ReleaseCompleted {
        tag: String,
        result: String,
    },
}

#[derive(Debug, Serialize)]
struct WebhookPayload {
    timestamp: DateTime<Utc>,
    event: WebhookEvent,
}

/// Configuration for outbound lifecycle-event webhooks. Disabled by
/// default; signing is optional (HMAC-SHA256, verified the same way the
/// receiving end would check an `X-Releasectl-Signature` header).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: Option<String>,
}

/// Fire-and-forget webhook notifier. Delivery failures are logged, never
/// propagated — matching [`StatusRenderer`]'s never-block guarantee.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let url = config.url.clone()?;
        Some(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .ok()?,
            url,
            secret: config.secret.clone(),
        })
    }

    pub fn notify(self: &Arc<Self>, event: WebhookEvent) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.send(event).await {
                tracing::warn!(error = %e, "webhook delivery failed (non-blocking)");
            }
        });
    }

    async fn send(&self, event: WebhookEvent) -> anyhow::Result<()> {
        let payload = WebhookPayload {
            timestamp: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&payload)?;

        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.secret {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .expect("HMAC can take a key of any size");
            mac.update(json.as_bytes());
            let signature = hex::encode(mac.finalize().into_bytes());
            request = request.header("X-Releasectl-Signature", format!("sha256={signature}"));
        }

        let response = request.body(json).send().await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "webhook returned error status {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
        Ok(())
    }
}
