//! HipChat v1 room-message sink.
//!
//! `POST {api_url}/v1/rooms/message?format=json&auth_token=...` with a
//! form-encoded body:
//! `room_id=..&from=..&message=..[&notify=1][&color=..]`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::ConfigMap;
use crate::error::{ConfigError, DeliveryError};
use crate::pipeline::types::{DeliveryReceipt, OutboundPayload};
use crate::sink::NotificationSink;

const DEFAULT_API_URL: &str = "https://api.hipchat.com";
const DEFAULT_COLOR: &str = "green";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ── Configuration ───────────────────────────────────────────────────

/// Chat API target. Read-only once the relay is running.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Base URL without the `/v1/...` path.
    pub api_url: String,
    pub room_id: String,
    /// Sender name shown in the room.
    pub bot_name: String,
    pub auth_token: SecretString,
    /// `None` leaves the color parameter off.
    pub color: Option<String>,
    pub notify: bool,
    pub timeout: Duration,
}

impl ChatConfig {
    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let color = match map.optional("hipchatColor") {
            None => Some(DEFAULT_COLOR.to_string()),
            Some(c) if c.eq_ignore_ascii_case("none") => None,
            Some(c) => Some(c.to_string()),
        };

        Ok(Self {
            api_url: map
                .optional("hipchatApiUrl")
                .unwrap_or(DEFAULT_API_URL)
                .trim_end_matches('/')
                .to_string(),
            room_id: map.required("hipchatRoomId")?.to_string(),
            bot_name: map.required("hipchatBotName")?.to_string(),
            auth_token: SecretString::from(map.required("hipchatAuthToken")?),
            color,
            notify: map.bool_or("hipchatNotify", true)?,
            timeout: Duration::from_secs(map.parse_or("hipchatTimeoutSecs", DEFAULT_TIMEOUT_SECS)?),
        })
    }
}

// ── Wire format ─────────────────────────────────────────────────────

/// One room message, as sent in the form body.
#[derive(Debug, Clone, Copy)]
pub struct RoomMessage<'a> {
    pub room_id: &'a str,
    pub from: &'a str,
    pub message: &'a str,
    pub notify: bool,
    pub color: Option<&'a str>,
}

impl RoomMessage<'_> {
    /// `application/x-www-form-urlencoded` body, fields in API order.
    pub fn form_body(&self) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("room_id", self.room_id)
            .append_pair("from", self.from)
            .append_pair("message", self.message);
        if self.notify {
            form.append_pair("notify", "1");
        }
        if let Some(color) = self.color {
            form.append_pair("color", color);
        }
        form.finish()
    }
}

/// Error envelope the API returns alongside non-2xx statuses.
#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    r#type: Option<String>,
    message: String,
}

/// Best-effort human reason for a rejected request.
fn rejection_reason(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(env) => match env.error.r#type {
            Some(kind) => format!("{kind}: {}", env.error.message),
            None => env.error.message,
        },
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string(),
    }
}

// ── Sink ────────────────────────────────────────────────────────────

/// Posts notifications to a single HipChat room.
pub struct HipChatSink {
    config: ChatConfig,
    client: reqwest::Client,
}

impl HipChatSink {
    pub fn new(config: ChatConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn message_url(&self) -> String {
        format!("{}/v1/rooms/message", self.config.api_url)
    }

    /// Send one room message. A single POST; failures are returned, not retried.
    pub async fn send_message(
        &self,
        message: &RoomMessage<'_>,
        auth_token: &SecretString,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let params = message.form_body();
        debug!(room_id = %message.room_id, params = %params, "Posting room message");

        let resp = self
            .client
            .post(self.message_url())
            .query(&[("format", "json"), ("auth_token", auth_token.expose_secret())])
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(params.clone())
            .send()
            .await
            .map_err(|e| {
                error!(room_id = %message.room_id, params = %params, error = %e, "Chat API request failed");
                if e.is_timeout() {
                    DeliveryError::Timeout {
                        room_id: message.room_id.to_string(),
                        timeout: self.config.timeout,
                    }
                } else {
                    DeliveryError::Transport {
                        room_id: message.room_id.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| DeliveryError::Transport {
            room_id: message.room_id.to_string(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            let reason = rejection_reason(status, &body);
            warn!(
                room_id = %message.room_id,
                status = status.as_u16(),
                params = %params,
                response = %body,
                "Chat API rejected message"
            );
            return Err(DeliveryError::Rejected {
                room_id: message.room_id.to_string(),
                status: status.as_u16(),
                reason,
                body,
            });
        }

        info!(
            room_id = %message.room_id,
            status = status.as_u16(),
            response = %body,
            "Delivered message to chat room"
        );
        Ok(DeliveryReceipt {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl NotificationSink for HipChatSink {
    fn name(&self) -> &str {
        "hipchat"
    }

    async fn deliver(&self, payload: &OutboundPayload) -> Result<DeliveryReceipt, DeliveryError> {
        let message = RoomMessage {
            room_id: &self.config.room_id,
            from: &self.config.bot_name,
            message: payload.as_str(),
            notify: self.config.notify,
            color: self.config.color.as_deref(),
        };
        self.send_message(&message, &self.config.auth_token).await
    }
}
