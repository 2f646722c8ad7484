//! Per-source normalizers: inbound event → `Notification`.

use tracing::debug;

use crate::pipeline::rules::TagRules;
use crate::pipeline::types::{IrcEvent, MailEvent, Notification};

/// Tag attached to every IRC-originated notification.
pub const IRC_TAG: &str = "irc";

/// Normalize an IRC message, or `None` if it isn't addressed to the bot.
///
/// The body drops `prefix` plus one separator character. This assumes the
/// prefix is followed by exactly one separator; a prefix that already ends
/// in its separator loses one extra character of the body. Messages too
/// short to have a body produce an empty one.
pub fn normalize_irc(event: &IrcEvent, address_prefix: &str) -> Option<Notification> {
    if !event.message.starts_with(address_prefix) {
        debug!(
            sender = %event.sender_user,
            target = %event.target_channel,
            "IRC message not addressed to bot, skipping"
        );
        return None;
    }

    let cut = address_prefix.chars().count() + 1;
    let body: String = event.message.chars().skip(cut).collect();

    Some(Notification {
        author: event.sender_user.clone(),
        subject: format!("Chatted on {}", event.target_channel),
        body,
        channel_tags: vec![IRC_TAG.to_string()],
    })
}

/// Normalize a mail event. Mail is never skipped; the body is not forwarded.
pub fn normalize_mail(event: &MailEvent, rules: &TagRules) -> Notification {
    Notification {
        author: event.from_address.clone(),
        subject: event.subject.clone(),
        body: String::new(),
        channel_tags: rules.classify(&event.subject),
    }
}
