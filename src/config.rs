//! Configuration types.
//!
//! The relay consumes an already-resolved key → value mapping. Keys use the
//! camelCase names below; [`ConfigMap::from_env`] reads each one from its
//! upper-snake-case environment variable (`imapUserName` → `IMAP_USER_NAME`).

use std::collections::HashMap;
use std::str::FromStr;

use crate::channels::imap::ImapConfig;
use crate::channels::irc::IrcConfig;
use crate::error::ConfigError;
use crate::pipeline::rules::TagRules;
use crate::sink::hipchat::ChatConfig;

/// Every key the relay understands.
pub const KNOWN_KEYS: &[&str] = &[
    "imapServer",
    "imapPort",
    "imapUserName",
    "imapPassword",
    "imapFolder",
    "imapPollingFrequency",
    "ircServer",
    "ircPort",
    "ircNickname",
    "ircChannel",
    "ircMessagePrefix",
    "hipchatApiUrl",
    "hipchatAuthToken",
    "hipchatRoomId",
    "hipchatBotName",
    "hipchatColor",
    "hipchatNotify",
    "hipchatTimeoutSecs",
    "mailChannelRules",
];

/// Environment variable name for a config key.
pub fn env_var_name(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(ch.to_ascii_uppercase());
    }
    out
}

/// Resolved configuration values. Blank values count as absent.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    values: HashMap<String, String>,
}

impl ConfigMap {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Collect every known key from the environment.
    pub fn from_env() -> Self {
        let values = KNOWN_KEYS
            .iter()
            .filter_map(|key| {
                std::env::var(env_var_name(key))
                    .ok()
                    .map(|v| ((*key).to_string(), v))
            })
            .collect();
        Self { values }
    }

    pub fn optional(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, key: &str) -> Result<&str, ConfigError> {
        self.optional(key).ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: format!("Set it in the config map or via {}", env_var_name(key)),
        })
    }

    /// Like [`required`](Self::required) but keeps surrounding whitespace,
    /// for values where it is significant (e.g. the IRC prefix).
    pub fn required_raw(&self, key: &str) -> Result<&str, ConfigError> {
        match self.values.get(key) {
            Some(v) if !v.is_empty() => Ok(v.as_str()),
            _ => self.required(key),
        }
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(default),
            Some("true" | "1" | "yes" | "on") => Ok(true),
            Some("false" | "0" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got {other:?}"),
            }),
        }
    }
}

impl From<HashMap<String, String>> for ConfigMap {
    fn from(values: HashMap<String, String>) -> Self {
        Self::new(values)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Split `host:port`, falling back to `default_port` when no port is given.
pub fn split_host_port(key: &str, server: &str, default_port: u16) -> Result<(String, u16), ConfigError> {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("bad port in {server:?}: {e}"),
            })?;
            Ok((host.to_string(), port))
        }
        _ => Ok((server.to_string(), default_port)),
    }
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub imap: ImapConfig,
    pub irc: IrcConfig,
    pub chat: ChatConfig,
    pub mail_rules: TagRules,
}

impl RelayConfig {
    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let mut mail_rules = TagRules::default_rules();
        if let Some(extra) = map.optional("mailChannelRules") {
            mail_rules.extend_from_spec("mailChannelRules", extra)?;
        }

        Ok(Self {
            imap: ImapConfig::from_map(map)?,
            irc: IrcConfig::from_map(map)?,
            chat: ChatConfig::from_map(map)?,
            mail_rules,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_map(&ConfigMap::from_env())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::ExposeSecret;

    use super::*;

    fn full_map() -> ConfigMap {
        [
            ("imapUserName", "bot@example.com"),
            ("imapPassword", "secret"),
            ("imapFolder", "camelbot"),
            ("imapPollingFrequency", "30000"),
            ("ircServer", "irc.irccloud.com"),
            ("ircChannel", "#flurfunk"),
            ("ircMessagePrefix", "camelbot:"),
            ("hipchatAuthToken", "T"),
            ("hipchatRoomId", "42"),
            ("hipchatBotName", "bot"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn env_var_names() {
        assert_eq!(env_var_name("imapUserName"), "IMAP_USER_NAME");
        assert_eq!(env_var_name("hipchatApiUrl"), "HIPCHAT_API_URL");
        assert_eq!(env_var_name("ircServer"), "IRC_SERVER");
    }

    #[test]
    fn full_map_parses_with_defaults() {
        let cfg = RelayConfig::from_map(&full_map()).unwrap();

        assert_eq!(cfg.imap.host, "imap.gmail.com");
        assert_eq!(cfg.imap.port, 993);
        assert_eq!(cfg.imap.folder, "camelbot");
        assert_eq!(cfg.imap.poll_interval, Duration::from_millis(30_000));
        assert_eq!(cfg.imap.password.expose_secret(), "secret");

        assert_eq!(cfg.irc.server, "irc.irccloud.com");
        assert_eq!(cfg.irc.port, 6667);
        assert_eq!(cfg.irc.nickname, "camelbot");
        assert_eq!(cfg.irc.channel, "#flurfunk");
        assert_eq!(cfg.irc.message_prefix, "camelbot:");

        assert_eq!(cfg.chat.api_url, "https://api.hipchat.com");
        assert_eq!(cfg.chat.room_id, "42");
        assert_eq!(cfg.chat.bot_name, "bot");
        assert_eq!(cfg.chat.auth_token.expose_secret(), "T");
        assert_eq!(cfg.chat.color.as_deref(), Some("green"));
        assert!(cfg.chat.notify);

        assert_eq!(cfg.mail_rules, TagRules::default_rules());
    }

    #[test]
    fn missing_required_key_is_reported() {
        let mut values: HashMap<String, String> = full_map().values;
        values.remove("hipchatRoomId");
        let err = RelayConfig::from_map(&ConfigMap::new(values)).unwrap_err();
        match err {
            ConfigError::MissingRequired { key, hint } => {
                assert_eq!(key, "hipchatRoomId");
                assert!(hint.contains("HIPCHAT_ROOM_ID"));
            }
            other => panic!("expected MissingRequired, got {other:?}"),
        }
    }

    #[test]
    fn blank_bot_name_is_rejected() {
        let mut values = full_map().values;
        values.insert("hipchatBotName".into(), "   ".into());
        let err = RelayConfig::from_map(&ConfigMap::new(values)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { key, .. } if key == "hipchatBotName"));
    }

    #[test]
    fn prefix_keeps_trailing_space() {
        let mut values = full_map().values;
        values.insert("ircMessagePrefix".into(), "camelbot: ".into());
        let cfg = RelayConfig::from_map(&ConfigMap::new(values)).unwrap();
        assert_eq!(cfg.irc.message_prefix, "camelbot: ");
    }

    #[test]
    fn server_with_port_overrides_default() {
        let mut values = full_map().values;
        values.insert("ircServer".into(), "irc.example.net:6668".into());
        values.insert("imapServer".into(), "mail.example.net:1993".into());
        let cfg = RelayConfig::from_map(&ConfigMap::new(values)).unwrap();
        assert_eq!((cfg.irc.server.as_str(), cfg.irc.port), ("irc.example.net", 6668));
        assert_eq!((cfg.imap.host.as_str(), cfg.imap.port), ("mail.example.net", 1993));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let mut values = full_map().values;
        values.insert("imapPollingFrequency".into(), "often".into());
        let err = RelayConfig::from_map(&ConfigMap::new(values)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "imapPollingFrequency"));
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let mut values = full_map().values;
        values.insert("hipchatNotify".into(), "maybe".into());
        let err = RelayConfig::from_map(&ConfigMap::new(values)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "hipchatNotify"));
    }

    #[test]
    fn color_none_disables_color() {
        let mut values = full_map().values;
        values.insert("hipchatColor".into(), "none".into());
        values.insert("hipchatNotify".into(), "false".into());
        let cfg = RelayConfig::from_map(&ConfigMap::new(values)).unwrap();
        assert_eq!(cfg.chat.color, None);
        assert!(!cfg.chat.notify);
    }

    #[test]
    fn extra_mail_rules_are_appended() {
        let mut values = full_map().values;
        values.insert("mailChannelRules".into(), "[deploy]=deploy".into());
        let cfg = RelayConfig::from_map(&ConfigMap::new(values)).unwrap();
        assert_eq!(cfg.mail_rules.rules().len(), 4);
        assert_eq!(cfg.mail_rules.classify("[deploy] v2"), vec!["deploy"]);
    }

    #[test]
    fn split_host_port_cases() {
        assert_eq!(split_host_port("k", "host", 1).unwrap(), ("host".to_string(), 1));
        assert_eq!(split_host_port("k", "host:2", 1).unwrap(), ("host".to_string(), 2));
        assert!(split_host_port("k", "host:x", 1).is_err());
    }
}
