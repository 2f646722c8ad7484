//! Subject-marker rules for classifying mail into channel tags.
//!
//! Rules are checked in order and every match adds its tag, so a subject
//! carrying several markers gets several tags in rule order. A subject that
//! matches nothing is still forwarded, just untagged.

use tracing::debug;

use crate::error::ConfigError;

/// A single marker → tag rule. Matching is a case-sensitive substring test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRule {
    pub marker: String,
    pub tag: String,
}

impl TagRule {
    pub fn new(marker: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            tag: tag.into(),
        }
    }

    pub fn matches(&self, subject: &str) -> bool {
        subject.contains(&self.marker)
    }
}

/// Ordered list of tag rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRules {
    rules: Vec<TagRule>,
}

impl TagRules {
    /// Built-in markers: commit mails, CI mails and Nagios alerts.
    pub fn default_rules() -> Self {
        Self {
            rules: vec![
                TagRule::new("[commits]", "commits"),
                TagRule::new("[ci]", "ci"),
                TagRule::new("Service Alert", "nagios"),
            ],
        }
    }

    /// No rules at all; every subject classifies to no tags.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule after the existing ones.
    pub fn add_rule(&mut self, marker: &str, tag: &str) {
        self.rules.push(TagRule::new(marker, tag));
    }

    /// Parse `marker=tag,marker=tag` and append each pair.
    ///
    /// The marker is everything before the last `=`, so markers may contain `=`.
    pub fn extend_from_spec(&mut self, key: &str, spec: &str) -> Result<(), ConfigError> {
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((marker, tag)) = entry.rsplit_once('=') else {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected marker=tag, got {entry:?}"),
                });
            };
            let (marker, tag) = (marker.trim(), tag.trim());
            if marker.is_empty() || tag.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("empty marker or tag in {entry:?}"),
                });
            }
            self.add_rule(marker, tag);
        }
        Ok(())
    }

    pub fn rules(&self) -> &[TagRule] {
        &self.rules
    }

    /// Tags for a subject, in rule order.
    pub fn classify(&self, subject: &str) -> Vec<String> {
        let tags: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(subject))
            .map(|rule| rule.tag.clone())
            .collect();

        debug!(subject = %subject, tags = ?tags, "Classified mail subject");
        tags
    }
}

impl Default for TagRules {
    fn default() -> Self {
        Self::default_rules()
    }
}
