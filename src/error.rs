//! Error types for relaybot.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Inbound source (IRC, IMAP) errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Protocol error on channel {name}: {reason}")]
    Protocol { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound delivery errors. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to build chat API client: {0}")]
    Client(String),

    #[error("Transport failure posting to room {room_id}: {reason}")]
    Transport { room_id: String, reason: String },

    #[error("Chat API timed out after {timeout:?} posting to room {room_id}")]
    Timeout { room_id: String, timeout: Duration },

    #[error("Chat API rejected message for room {room_id} with status {status}: {reason}")]
    Rejected {
        room_id: String,
        status: u16,
        reason: String,
        body: String,
    },
}

impl DeliveryError {
    /// HTTP status returned by the chat API, if the request got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
