//! Inbound event sources.
//!
//! Each source yields a stream of its own event type. The coordinator
//! consumes each stream in its own task.

pub mod imap;
pub mod irc;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;

pub use imap::{ImapConfig, ImapSource};
pub use irc::{IrcConfig, IrcSource};

/// Stream of inbound events from one source.
pub type EventStream<E> = Pin<Box<dyn Stream<Item = E> + Send>>;

/// A producer of inbound events (IRC listener, mailbox poller, ...).
#[async_trait]
pub trait EventSource: Send + Sync {
    type Event: Send + 'static;

    fn name(&self) -> &str;

    /// Start producing events. The stream ends when the source shuts down.
    async fn start(&self) -> Result<EventStream<Self::Event>, ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError>;
}
