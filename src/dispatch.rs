//! Notification dispatch.
//!
//! Turns a triggered flow into one outbound webhook request: gate on the
//! configured condition, render the message and embed, pull any referenced
//! images into scratch files, and deliver as JSON or multipart. Trigger
//! state is owned by the scheduler; it only advances when this module
//! reports success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::embed::{self, Embed};
use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::images::{DownloadedImage, ImageFetcher};
use crate::notify_log::{EmbedSummary, NotificationLog};
use crate::store::FlowStore;
use crate::{condition, template};

const WEBHOOK_TIMEOUT_SECS: u64 = 10;
/// Attachment uploads get more headroom.
const WEBHOOK_UPLOAD_TIMEOUT_SECS: u64 = 30;
/// The webhook's documented "accepted, no body" status.
const ACCEPTED_STATUS: u16 = 204;

/// Outcome of a dispatch attempt that did not fail.
///
/// A gating condition that evaluates false means the trigger was handled,
/// not that it failed; the scheduler advances state for both variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Suppressed,
}

/// Delivery seam used by the scheduler, mockable in tests.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        message_template: &str,
        flow: &Flow,
        data: Option<&Value>,
    ) -> Result<Delivery>;
}

/// Outbound webhook wire payload.
#[derive(Debug, Serialize)]
struct WebhookPayload {
    username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<Embed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar_url: Option<String>,
}

/// Renders and delivers notifications.
pub struct Dispatcher {
    client: Client,
    fetcher: ImageFetcher,
    store: Arc<FlowStore>,
    log: NotificationLog,
}

impl Dispatcher {
    pub fn new(store: Arc<FlowStore>, log: NotificationLog) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_UPLOAD_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build webhook client with defaults: {}", e);
                Client::new()
            });
        Self { client, fetcher: ImageFetcher::new(), store, log }
    }

    /// Render and deliver one notification for `flow`.
    ///
    /// `data` is the live trigger payload; when absent the flow's stored
    /// `last_data` is used (resends, incoming flows).
    pub async fn send(
        &self,
        message_template: &str,
        flow: &Flow,
        data: Option<&Value>,
    ) -> Result<Delivery> {
        let doc = self.store.load().await?;
        let settings = &doc.settings;
        let user_vars = &doc.user_variables;

        let webhook_url = flow
            .webhook_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(settings.default_webhook_url.as_str());
        if webhook_url.is_empty() {
            return Err(Error::Dispatch(format!(
                "flow '{}' has no webhook URL and no default is configured",
                flow.name
            )));
        }

        let context = match data {
            Some(value) => value.clone(),
            None => flow.last_data_value(),
        };

        // Gate before doing any rendering or network work.
        if flow.condition_enabled
            && !flow.condition.trim().is_empty()
            && !condition::evaluate(&flow.condition, &context, user_vars)
        {
            info!(flow = %flow.name, condition = %flow.condition, "condition not met, suppressed");
            return Ok(Delivery::Suppressed);
        }

        let rendered = template::render(message_template, &context, user_vars);

        let mut embed_images = Vec::new();
        let mut embed = None;
        if let Some(config) = &flow.embed {
            if let Some((built, urls)) = embed::build(config, &context, user_vars) {
                embed = Some(built);
                embed_images = urls;
            }
        }

        // Download every referenced image; a failed download drops that
        // attachment but not the notification.
        let mut images: Vec<DownloadedImage> = Vec::new();
        for url in rendered.image_urls.iter().chain(embed_images.iter()) {
            if images.iter().any(|img| img.source_url == *url) {
                continue;
            }
            match self.fetcher.fetch(url).await {
                Ok(image) => images.push(image),
                Err(e) => warn!(flow = %flow.name, url = %url, error = %e, "image skipped"),
            }
        }

        if let Some(embed) = embed.as_mut() {
            rewrite_attachment_urls(embed, &images);
        }

        let username = flow
            .webhook_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| settings.default_webhook_name.clone());
        let avatar = flow
            .webhook_avatar
            .clone()
            .filter(|a| !a.is_empty())
            .or_else(|| {
                (!settings.default_webhook_avatar.is_empty())
                    .then(|| settings.default_webhook_avatar.clone())
            });

        let payload = build_payload(username.clone(), &rendered.text, embed.clone(), avatar);

        let result = self.post(webhook_url, &payload, &images).await;

        // Scratch files go away whether or not the webhook accepted.
        for image in &images {
            image.release();
        }

        match result {
            Ok(()) => {
                let summary = embed.as_ref().map(EmbedSummary::of);
                let retention = settings.notification_log_retention;
                self.log.record(&flow.name, &rendered.text, summary, &username, retention);
                let sent = self.store.increment_sent_counter().await?;
                info!(flow = %flow.name, total_sent = sent, "notification delivered");
                Ok(Delivery::Sent)
            }
            Err(e) => Err(e),
        }
    }

    async fn post(
        &self,
        webhook_url: &str,
        payload: &WebhookPayload,
        images: &[DownloadedImage],
    ) -> Result<()> {
        let status = if images.is_empty() {
            self.client
                .post(webhook_url)
                .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
                .json(payload)
                .send()
                .await
                .map_err(|e| Error::Dispatch(format!("webhook request failed: {}", e)))?
                .status()
        } else {
            let json = serde_json::to_string(payload)
                .map_err(|e| Error::Dispatch(format!("payload serialization failed: {}", e)))?;
            let mut form = reqwest::multipart::Form::new().text("payload_json", json);
            for (i, image) in images.iter().enumerate() {
                let bytes = tokio::fs::read(&image.path).await.map_err(|e| {
                    Error::Dispatch(format!("attachment {} unreadable: {}", image.file_name, e))
                })?;
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(image.file_name.clone());
                form = form.part(format!("files[{}]", i), part);
            }
            self.client
                .post(webhook_url)
                .multipart(form)
                .send()
                .await
                .map_err(|e| Error::Dispatch(format!("webhook upload failed: {}", e)))?
                .status()
        };

        // Multipart deliveries answer 200 with a body instead of 204.
        let accepted =
            status.as_u16() == ACCEPTED_STATUS || (!images.is_empty() && status.is_success());
        if accepted {
            Ok(())
        } else {
            Err(Error::Dispatch(format!("webhook rejected delivery with status {}", status)))
        }
    }
}

#[async_trait]
impl Deliver for Dispatcher {
    async fn deliver(
        &self,
        message_template: &str,
        flow: &Flow,
        data: Option<&Value>,
    ) -> Result<Delivery> {
        self.send(message_template, flow, data).await
    }
}

fn build_payload(
    username: String,
    content: &str,
    embed: Option<Embed>,
    avatar_url: Option<String>,
) -> WebhookPayload {
    WebhookPayload {
        username,
        // Blank content is omitted entirely so embed-only payloads stay valid.
        content: (!content.trim().is_empty()).then(|| content.to_string()),
        embeds: embed.into_iter().collect(),
        avatar_url,
    }
}

/// Point embed media at the uploaded attachments instead of the remote URLs.
fn rewrite_attachment_urls(embed: &mut Embed, images: &[DownloadedImage]) {
    let rewritten = |url: &str| -> Option<String> {
        images
            .iter()
            .find(|img| img.source_url == url)
            .map(|img| format!("attachment://{}", img.file_name))
    };
    if let Some(media) = embed.image.as_mut() {
        if let Some(reference) = rewritten(&media.url) {
            media.url = reference;
        }
    }
    if let Some(media) = embed.thumbnail.as_mut() {
        if let Some(reference) = rewritten(&media.url) {
            media.url = reference;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::TriggerType;
    use serde_json::json;
    use std::path::PathBuf;

    fn test_dispatcher(dir: &tempfile::TempDir) -> Dispatcher {
        let store = Arc::new(FlowStore::open(dir.path().join("flows.json")));
        let log = NotificationLog::open(dir.path().join("sent.json"));
        Dispatcher::new(store, log)
    }

    #[test]
    fn test_payload_omits_blank_content() {
        let payload = build_payload("bot".to_string(), "   ", None, None);
        let raw = serde_json::to_value(&payload).unwrap();
        assert!(raw.get("content").is_none());
        assert!(raw.get("embeds").is_none());
        assert!(raw.get("avatar_url").is_none());
        assert_eq!(raw["username"], "bot");
    }

    #[test]
    fn test_payload_with_embed_and_avatar() {
        let embed = Embed { title: Some("t".to_string()), ..Default::default() };
        let payload = build_payload(
            "bot".to_string(),
            "hello",
            Some(embed),
            Some("http://a/v.png".to_string()),
        );
        let raw = serde_json::to_value(&payload).unwrap();
        assert_eq!(raw["content"], "hello");
        assert_eq!(raw["embeds"][0]["title"], "t");
        assert_eq!(raw["avatar_url"], "http://a/v.png");
    }

    #[test]
    fn test_rewrite_attachment_urls() {
        let mut embed = Embed {
            image: Some(crate::embed::EmbedMedia { url: "http://x/a.png".to_string() }),
            thumbnail: Some(crate::embed::EmbedMedia { url: "http://x/other.png".to_string() }),
            ..Default::default()
        };
        let images = vec![DownloadedImage {
            path: PathBuf::from("/tmp/ignored"),
            file_name: "image_aabbccdd.png".to_string(),
            source_url: "http://x/a.png".to_string(),
        }];

        rewrite_attachment_urls(&mut embed, &images);
        assert_eq!(embed.image.unwrap().url, "attachment://image_aabbccdd.png");
        // Untouched: its URL was not downloaded.
        assert_eq!(embed.thumbnail.unwrap().url, "http://x/other.png");
    }

    #[tokio::test]
    async fn test_missing_webhook_is_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(&dir);

        let flow = Flow::new("f", TriggerType::Timer);
        let result = dispatcher.send("hi", &flow, Some(&json!({}))).await;
        assert!(matches!(result, Err(Error::Dispatch(_))));
    }

    #[tokio::test]
    async fn test_false_condition_suppresses_without_sending() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(&dir);

        let mut flow = Flow::new("f", TriggerType::Timer);
        // The URL is never contacted: gating runs first.
        flow.webhook_url = Some("http://127.0.0.1:1/webhook".to_string());
        flow.condition_enabled = true;
        flow.condition = "value > 100".to_string();

        let outcome =
            dispatcher.send("hi", &flow, Some(&json!({"value": 5}))).await.unwrap();
        assert_eq!(outcome, Delivery::Suppressed);

        // Nothing was logged or counted.
        assert!(dispatcher.log.entries().unwrap().is_empty());
        assert_eq!(dispatcher.store.load().await.unwrap().notifications_sent, 0);
    }

    #[tokio::test]
    async fn test_failed_condition_context_falls_back_to_last_data() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(&dir);

        let mut flow = Flow::new("f", TriggerType::OnIncoming);
        flow.webhook_url = Some("http://127.0.0.1:1/webhook".to_string());
        flow.condition_enabled = true;
        flow.condition = "status == 'ok'".to_string();
        flow.last_data = Some(json!({"status": "down"}));

        let outcome = dispatcher.send("hi", &flow, None).await.unwrap();
        assert_eq!(outcome, Delivery::Suppressed);
    }
}
