//! IRC source: keeps a connection to one channel and yields its messages.
//!
//! Plain-TCP client speaking just enough of RFC 2812 to register, join,
//! answer PINGs and read PRIVMSGs. Reconnects after a short delay when the
//! connection drops.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::channels::{EventSource, EventStream};
use crate::config::{ConfigMap, split_host_port};
use crate::error::{ChannelError, ConfigError};
use crate::pipeline::types::IrcEvent;

const DEFAULT_PORT: u16 = 6667;
const DEFAULT_NICKNAME: &str = "camelbot";
const RECONNECT_DELAY: Duration = Duration::from_secs(10);
/// 512-byte message plus the 8191 bytes allowed for IRCv3 tags.
const MAX_LINE_BYTES: u64 = 512 + 8191;

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IrcConfig {
    pub server: String,
    pub port: u16,
    pub nickname: String,
    /// Channel to join, e.g. `#flurfunk`.
    pub channel: String,
    /// Messages must start with this to be relayed.
    pub message_prefix: String,
    pub reconnect_delay: Duration,
}

impl IrcConfig {
    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let default_port = map.parse_or("ircPort", DEFAULT_PORT)?;
        let (server, port) = split_host_port("ircServer", map.required("ircServer")?, default_port)?;

        Ok(Self {
            server,
            port,
            nickname: map.optional("ircNickname").unwrap_or(DEFAULT_NICKNAME).to_string(),
            channel: map.required("ircChannel")?.to_string(),
            message_prefix: map.required_raw("ircMessagePrefix")?.to_string(),
            reconnect_delay: RECONNECT_DELAY,
        })
    }
}

// ── Line parsing ────────────────────────────────────────────────────

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine<'a> {
    pub prefix: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
}

/// Parse `[@tags] [:prefix] COMMAND params [:trailing]`.
pub fn parse_line(line: &str) -> Option<IrcLine<'_>> {
    let mut rest = line.trim_end_matches(['\r', '\n']);

    if rest.starts_with('@') {
        rest = rest.split_once(' ')?.1;
    }

    let prefix = match rest.strip_prefix(':') {
        Some(stripped) => {
            let (prefix, tail) = stripped.split_once(' ')?;
            rest = tail;
            Some(prefix)
        }
        None => None,
    };

    rest = rest.trim_start_matches(' ');
    let (command, mut rest) = match rest.split_once(' ') {
        Some((cmd, tail)) => (cmd, tail),
        None => (rest, ""),
    };
    if command.is_empty() {
        return None;
    }

    let mut params = Vec::new();
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing);
            break;
        }
        match rest.split_once(' ') {
            Some((param, tail)) => {
                params.push(param);
                rest = tail;
            }
            None => {
                params.push(rest);
                break;
            }
        }
    }

    Some(IrcLine {
        prefix,
        command,
        params,
    })
}

/// Split `nick!user@host` into `(nick, host)`.
pub fn split_user_prefix(prefix: &str) -> (&str, &str) {
    let (nick, rest) = prefix.split_once('!').unwrap_or((prefix, ""));
    let host = rest.split_once('@').map_or("", |(_, host)| host);
    (nick, host)
}

/// Turn a PRIVMSG to `channel` into an event. Anything else yields `None`.
pub fn privmsg_event(line: &IrcLine<'_>, channel: &str) -> Option<IrcEvent> {
    if !line.command.eq_ignore_ascii_case("PRIVMSG") {
        return None;
    }
    let [target, text] = line.params.as_slice() else {
        return None;
    };
    if !target.eq_ignore_ascii_case(channel) {
        return None;
    }
    let (nick, host) = split_user_prefix(line.prefix?);
    Some(IrcEvent::new(*text, nick, host, *target))
}

// ── Source ──────────────────────────────────────────────────────────

/// How a single connection ended.
enum ConnectionEnd {
    Shutdown,
    ReceiverClosed,
}

/// Long-lived IRC listener.
pub struct IrcSource {
    config: IrcConfig,
    shutdown: watch::Sender<bool>,
}

impl IrcSource {
    pub fn new(config: IrcConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { config, shutdown }
    }

    pub fn config(&self) -> &IrcConfig {
        &self.config
    }
}

#[async_trait]
impl EventSource for IrcSource {
    type Event = IrcEvent;

    fn name(&self) -> &str {
        "irc"
    }

    async fn start(&self) -> Result<EventStream<IrcEvent>, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!(
                server = %config.server,
                port = config.port,
                channel = %config.channel,
                "IRC listener starting"
            );

            loop {
                match run_connection(&config, &tx, &mut shutdown).await {
                    Ok(ConnectionEnd::Shutdown) => {
                        info!("IRC listener shutting down");
                        return;
                    }
                    Ok(ConnectionEnd::ReceiverClosed) => {
                        info!("IRC event receiver closed");
                        return;
                    }
                    Err(e) => {
                        error!("IRC connection failed: {e}");
                    }
                }

                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("IRC listener shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(config.reconnect_delay) => {
                        debug!("Reconnecting to IRC");
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        info!("IRC channel shutting down");
        self.shutdown.send_replace(true);
        Ok(())
    }
}

/// Read one `\n`-terminated line into `buf`, refusing lines over `max` bytes.
/// Returns 0 at end of stream.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: u64) -> Result<usize, ChannelError>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader).take(max).read_until(b'\n', buf).await?;
    if read as u64 == max && !buf.ends_with(b"\n") {
        return Err(ChannelError::Protocol {
            name: "irc".into(),
            reason: format!("line exceeds {max} bytes"),
        });
    }
    Ok(read)
}

async fn send_raw(writer: &mut OwnedWriteHalf, line: &str) -> Result<(), ChannelError> {
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Run one connection until it drops or shutdown is requested.
async fn run_connection(
    config: &IrcConfig,
    tx: &mpsc::UnboundedSender<IrcEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ConnectionEnd, ChannelError> {
    if *shutdown.borrow() {
        return Ok(ConnectionEnd::Shutdown);
    }

    let stream = TcpStream::connect((config.server.as_str(), config.port)).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut nickname = config.nickname.clone();

    send_raw(&mut writer, &format!("NICK {nickname}")).await?;
    send_raw(&mut writer, &format!("USER {nickname} 0 * :{nickname}")).await?;

    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                let _ = send_raw(&mut writer, "QUIT :shutting down").await;
                return Ok(ConnectionEnd::Shutdown);
            }
            read = read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES) => read?,
        };
        if read == 0 {
            return Err(ChannelError::Disconnected {
                name: "irc".into(),
                reason: "server closed the connection".into(),
            });
        }

        let raw = String::from_utf8_lossy(&buf);
        let Some(line) = parse_line(&raw) else {
            continue;
        };

        match line.command {
            "PING" => {
                let token = line.params.first().copied().unwrap_or_default();
                send_raw(&mut writer, &format!("PONG :{token}")).await?;
            }
            "001" => {
                info!(nick = %nickname, channel = %config.channel, "Registered, joining channel");
                send_raw(&mut writer, &format!("JOIN {}", config.channel)).await?;
            }
            "433" => {
                nickname.push('_');
                warn!(nick = %nickname, "Nickname in use, retrying");
                send_raw(&mut writer, &format!("NICK {nickname}")).await?;
            }
            "ERROR" => {
                return Err(ChannelError::Disconnected {
                    name: "irc".into(),
                    reason: line.params.join(" "),
                });
            }
            _ => {
                if let Some(event) = privmsg_event(&line, &config.channel) {
                    debug!(sender = %event.sender_user, target = %event.target_channel, "IRC message received");
                    if tx.send(event).is_err() {
                        let _ = send_raw(&mut writer, "QUIT").await;
                        return Ok(ConnectionEnd::ReceiverClosed);
                    }
                }
            }
        }
    }
}
