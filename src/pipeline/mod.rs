//! Notification pipeline.
//!
//! Every inbound event flows through:
//! 1. `normalize`: source-specific filtering and field mapping
//! 2. `rules::TagRules::classify()`: subject markers to channel tags (mail only)
//! 3. `format::format_payload()`: the XML-like envelope posted to chat
//! 4. `relay::Dispatcher`: hands the payload to the sink, one attempt per event

pub mod format;
pub mod normalize;
pub mod relay;
pub mod rules;
pub mod types;
