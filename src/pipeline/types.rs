//! Shared types for the relay pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::format::format_payload;

// ── Inbound events ──────────────────────────────────────────────────

/// A message seen on the IRC channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrcEvent {
    /// Raw message text as sent to the channel.
    pub message: String,
    /// Nickname of the sender.
    pub sender_user: String,
    /// Host the sender is connected from.
    pub sender_server_host: String,
    /// Channel (or nick) the message was addressed to.
    pub target_channel: String,
    pub received_at: DateTime<Utc>,
}

impl IrcEvent {
    pub fn new(
        message: impl Into<String>,
        sender_user: impl Into<String>,
        sender_server_host: impl Into<String>,
        target_channel: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            sender_user: sender_user.into(),
            sender_server_host: sender_server_host.into(),
            target_channel: target_channel.into(),
            received_at: Utc::now(),
        }
    }
}

/// A message found in the watched mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailEvent {
    /// Rendered From header (`Name <addr>` or bare address).
    pub from_address: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
}

impl MailEvent {
    pub fn new(from_address: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from_address: from_address.into(),
            subject: subject.into(),
            received_at: Utc::now(),
        }
    }
}

/// An event from either inbound source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InboundEvent {
    Irc(IrcEvent),
    Mail(MailEvent),
}

impl InboundEvent {
    /// Short label for logging.
    pub fn source(&self) -> &'static str {
        match self {
            Self::Irc(_) => "irc",
            Self::Mail(_) => "mail",
        }
    }
}

impl From<IrcEvent> for InboundEvent {
    fn from(event: IrcEvent) -> Self {
        Self::Irc(event)
    }
}

impl From<MailEvent> for InboundEvent {
    fn from(event: MailEvent) -> Self {
        Self::Mail(event)
    }
}

// ── Notification ────────────────────────────────────────────────────

/// Source-agnostic message destined for the chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub author: String,
    pub subject: String,
    pub body: String,
    /// Classification tags in insertion order. Empty means nothing matched.
    pub channel_tags: Vec<String>,
}

impl Notification {
    /// Comma-joined tags, insertion order preserved.
    pub fn tags_csv(&self) -> String {
        self.channel_tags.join(",")
    }

    /// Render the wire payload for this notification.
    pub fn to_payload(&self) -> OutboundPayload {
        format_payload(&self.author, &self.subject, &self.body, &self.tags_csv())
    }
}

// ── Outbound payload ────────────────────────────────────────────────

/// Serialized `<message>` fragment ready for the chat API.
///
/// Only constructed by the formatter, so the text is always well formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPayload(String);

impl OutboundPayload {
    pub(crate) fn new(text: String) -> Self {
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OutboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Delivery receipt / stats ────────────────────────────────────────

/// Successful delivery: the API accepted the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub status: u16,
    /// Full response body, kept for diagnostics.
    pub body: String,
}

/// Per-source counters returned when a relay loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub received: u64,
    pub skipped: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl RelayStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            received: self.received + other.received,
            skipped: self.skipped + other.skipped,
            delivered: self.delivered + other.delivered,
            failed: self.failed + other.failed,
        }
    }
}
