//! Outbound messaging transport.
//!
//! Two calls, typed errors. The pipeline decides retry/skip from the error
//! variant alone, so transports must map their wire failures honestly:
//! a 429 is `RateLimited`, an unknown chat is `InvalidRecipient`, network
//! weather is `Transient`, everything unfixable is `Permanent`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;

use crate::config::Config;

#[derive(Debug, Clone)]
pub enum SendError {
    RateLimited { retry_after_secs: i64 },
    InvalidRecipient,
    Transient(String),
    Permanent(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            SendError::InvalidRecipient => write!(f, "invalid recipient"),
            SendError::Transient(msg) => write!(f, "transient send failure: {msg}"),
            SendError::Permanent(msg) => write!(f, "permanent send failure: {msg}"),
        }
    }
}

impl std::error::Error for SendError {}

#[derive(Debug, Clone)]
pub struct Button {
    pub text: String,
    pub url: String,
}

#[async_trait]
pub trait MessagingTransport: Send + Sync {
    /// Send a caption with up to 5 images. Returns the message id to edit
    /// later.
    async fn send_media_group(
        &self,
        recipient: &str,
        images: &[String],
        caption: &str,
        buttons: &[Button],
    ) -> Result<i64, SendError>;

    async fn edit_message(
        &self,
        recipient: &str,
        message_id: i64,
        new_caption: &str,
    ) -> Result<(), SendError>;
}

// ---- Telegram Bot API implementation ----------------------------------

pub struct TelegramTransport {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct TgResponse {
    ok: bool,
    description: Option<String>,
    result: Option<serde_json::Value>,
    parameters: Option<TgParameters>,
}

#[derive(Debug, Deserialize)]
struct TgParameters {
    retry_after: Option<i64>,
}

impl TelegramTransport {
    pub fn new(config: &Config) -> Result<Self, SendError> {
        let token = config
            .messaging_bot_token
            .clone()
            .ok_or_else(|| SendError::Permanent("MESSAGING_BOT_TOKEN not configured".into()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("CarScout/1.0 (delivery)")
            .build()
            .map_err(|e| SendError::Permanent(format!("build http client: {e}")))?;
        Ok(Self {
            http,
            api_base: config.messaging_api_base.clone(),
            token,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<TgResponse, SendError> {
        let resp = self
            .http
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))?;

        let status = resp.status();
        let parsed: TgResponse = resp
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("bad response body: {e}")))?;

        if parsed.ok {
            return Ok(parsed);
        }
        let description = parsed.description.unwrap_or_default();
        if status.as_u16() == 429 {
            let retry_after_secs = parsed
                .parameters
                .and_then(|p| p.retry_after)
                .unwrap_or(30);
            return Err(SendError::RateLimited { retry_after_secs });
        }
        let lower = description.to_lowercase();
        if lower.contains("chat not found")
            || lower.contains("user is deactivated")
            || lower.contains("bot was blocked")
        {
            return Err(SendError::InvalidRecipient);
        }
        if status.is_server_error() {
            return Err(SendError::Transient(description));
        }
        Err(SendError::Permanent(description))
    }
}

#[async_trait]
impl MessagingTransport for TelegramTransport {
    async fn send_media_group(
        &self,
        recipient: &str,
        images: &[String],
        caption: &str,
        buttons: &[Button],
    ) -> Result<i64, SendError> {
        let resp = if images.is_empty() {
            let keyboard: Vec<Vec<serde_json::Value>> = buttons
                .iter()
                .map(|b| vec![serde_json::json!({"text": b.text, "url": b.url})])
                .collect();
            self.call(
                "sendMessage",
                serde_json::json!({
                    "chat_id": recipient,
                    "text": caption,
                    "reply_markup": {"inline_keyboard": keyboard},
                }),
            )
            .await?
        } else {
            let media: Vec<serde_json::Value> = images
                .iter()
                .take(5)
                .enumerate()
                .map(|(i, url)| {
                    let mut item = serde_json::json!({"type": "photo", "media": url});
                    if i == 0 {
                        item["caption"] = serde_json::Value::String(caption.to_string());
                    }
                    item
                })
                .collect();
            self.call(
                "sendMediaGroup",
                serde_json::json!({"chat_id": recipient, "media": media}),
            )
            .await?
        };

        // single message object or an array for media groups
        let message_id = match resp.result {
            Some(serde_json::Value::Array(messages)) => messages
                .first()
                .and_then(|m| m.get("message_id"))
                .and_then(|v| v.as_i64()),
            Some(obj) => obj.get("message_id").and_then(|v| v.as_i64()),
            None => None,
        };
        message_id.ok_or_else(|| SendError::Transient("no message_id in response".into()))
    }

    async fn edit_message(
        &self,
        recipient: &str,
        message_id: i64,
        new_caption: &str,
    ) -> Result<(), SendError> {
        self.call(
            "editMessageCaption",
            serde_json::json!({
                "chat_id": recipient,
                "message_id": message_id,
                "caption": new_caption,
            }),
        )
        .await?;
        Ok(())
    }
}

/// Logs instead of sending. Used when no bot token is configured so the
/// pipeline can run end to end in development.
pub struct DryRunTransport {
    next_message_id: Mutex<i64>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self {
            next_message_id: Mutex::new(1),
        }
    }
}

impl Default for DryRunTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingTransport for DryRunTransport {
    async fn send_media_group(
        &self,
        recipient: &str,
        images: &[String],
        caption: &str,
        _buttons: &[Button],
    ) -> Result<i64, SendError> {
        let mut id = self.next_message_id.lock();
        *id += 1;
        tracing::info!(
            recipient,
            images = images.len(),
            message_id = *id,
            "DRY RUN send: {}",
            caption.lines().next().unwrap_or("")
        );
        Ok(*id)
    }

    async fn edit_message(
        &self,
        recipient: &str,
        message_id: i64,
        new_caption: &str,
    ) -> Result<(), SendError> {
        tracing::info!(
            recipient,
            message_id,
            "DRY RUN edit: {}",
            new_caption.lines().next().unwrap_or("")
        );
        Ok(())
    }
}

// ---- recording mock for tests ------------------------------------------

#[derive(Debug, Clone)]
pub enum SentKind {
    MediaGroup {
        recipient: String,
        image_count: usize,
        caption: String,
    },
    Edit {
        recipient: String,
        message_id: i64,
        caption: String,
    },
}

/// Records every send; optionally fails each call with a fixed error.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<SentKind>>,
    pub fail_with: Mutex<Option<SendError>>,
    next_message_id: Mutex<i64>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            next_message_id: Mutex::new(1000),
            ..Default::default()
        }
    }

    pub fn fail_next(&self, err: SendError) {
        *self.fail_with.lock() = Some(err);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MessagingTransport for RecordingTransport {
    async fn send_media_group(
        &self,
        recipient: &str,
        images: &[String],
        caption: &str,
        _buttons: &[Button],
    ) -> Result<i64, SendError> {
        if let Some(err) = self.fail_with.lock().take() {
            return Err(err);
        }
        self.sent.lock().push(SentKind::MediaGroup {
            recipient: recipient.to_string(),
            image_count: images.len().min(5),
            caption: caption.to_string(),
        });
        let mut id = self.next_message_id.lock();
        *id += 1;
        Ok(*id)
    }

    async fn edit_message(
        &self,
        recipient: &str,
        message_id: i64,
        new_caption: &str,
    ) -> Result<(), SendError> {
        if let Some(err) = self.fail_with.lock().take() {
            return Err(err);
        }
        self.sent.lock().push(SentKind::Edit {
            recipient: recipient.to_string(),
            message_id,
            caption: new_caption.to_string(),
        });
        Ok(())
    }
}
