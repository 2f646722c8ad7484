//! Outbound delivery of formatted notifications.

pub mod hipchat;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::pipeline::types::{DeliveryReceipt, OutboundPayload};

pub use hipchat::{ChatConfig, HipChatSink};

/// Where notifications end up. One call per notification, never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, payload: &OutboundPayload) -> Result<DeliveryReceipt, DeliveryError>;
}
