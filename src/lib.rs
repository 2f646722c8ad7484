//! relaybot: relays IRC mentions and mailbox notifications into a chat room.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod sink;
