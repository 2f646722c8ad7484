//! IMAP source: polls a mailbox folder and yields one event per new mail.
//!
//! Each poll logs in over TLS, searches UNSEEN, fetches only the From,
//! Subject and Message-ID headers, marks the message `\Seen` and logs out.
//! Blocking socket I/O runs in `spawn_blocking`.

use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mail_parser::MessageParser;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{EventSource, EventStream};
use crate::config::{ConfigMap, split_host_port};
use crate::error::{ChannelError, ConfigError};
use crate::pipeline::types::MailEvent;

const DEFAULT_HOST: &str = "imap.gmail.com";
const DEFAULT_PORT: u16 = 993;
const DEFAULT_FOLDER: &str = "INBOX";
const DEFAULT_POLL_MILLIS: u64 = 60_000;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on a header-fields literal; anything larger is refused.
const MAX_LITERAL_BYTES: usize = 64 * 1024;
/// Message-IDs remembered for dedup before the oldest are forgotten.
const SEEN_CAPACITY: usize = 4096;

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
    pub poll_interval: Duration,
}

impl ImapConfig {
    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let default_port = map.parse_or("imapPort", DEFAULT_PORT)?;
        let (host, port) = split_host_port(
            "imapServer",
            map.optional("imapServer").unwrap_or(DEFAULT_HOST),
            default_port,
        )?;
        let poll_millis: u64 = map.parse_or("imapPollingFrequency", DEFAULT_POLL_MILLIS)?;
        if poll_millis == 0 {
            return Err(ConfigError::InvalidValue {
                key: "imapPollingFrequency".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            host,
            port,
            username: map.required("imapUserName")?.to_string(),
            password: SecretString::from(map.required("imapPassword")?),
            folder: map.optional("imapFolder").unwrap_or(DEFAULT_FOLDER).to_string(),
            poll_interval: Duration::from_millis(poll_millis),
        })
    }
}

// ── Header helpers (public for testing) ─────────────────────────────

/// Render a From address the way mail clients print it.
pub fn render_from(name: Option<&str>, address: Option<&str>) -> String {
    let name = name.map(str::trim).filter(|n| !n.is_empty());
    let address = address.map(str::trim).filter(|a| !a.is_empty());
    match (name, address) {
        (Some(name), Some(addr)) => format!("{name} <{addr}>"),
        (None, Some(addr)) => addr.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// A fetched mail: (message_id, event).
pub type FetchedMail = (String, MailEvent);

/// Parse fetched header bytes into a mail event.
pub fn parse_headers(raw: &[u8]) -> Option<FetchedMail> {
    let parsed = MessageParser::default().parse_headers(raw)?;

    let from = parsed.from().and_then(|addr| addr.first());
    let from = render_from(
        from.and_then(|a| a.name()),
        from.and_then(|a| a.address()),
    );
    let subject = parsed.subject().unwrap_or_default().to_string();
    let msg_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    Some((msg_id, MailEvent::new(from, subject)))
}

/// Sequence numbers from `* SEARCH 1 2 3` lines.
pub fn parse_search(lines: &[Vec<u8>]) -> Vec<u32> {
    lines
        .iter()
        .map(|l| String::from_utf8_lossy(l))
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| {
            l.split_whitespace()
                .skip(2)
                .filter_map(|n| n.parse().ok())
                .collect::<Vec<u32>>()
        })
        .collect()
}

/// Pull the `{n}` literal out of a FETCH response. Literals over
/// `MAX_LITERAL_BYTES` yield `None`.
pub fn extract_literal(lines: &[Vec<u8>]) -> Option<Vec<u8>> {
    let mut iter = lines.iter();
    let size = iter.by_ref().find_map(|line| {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        let open = text.rfind('{')?;
        text.strip_suffix('}')?[open + 1..].parse::<usize>().ok()
    })?;
    if size > MAX_LITERAL_BYTES {
        warn!(size, "Refusing oversized IMAP literal");
        return None;
    }

    let mut literal = Vec::with_capacity(size);
    for line in iter {
        if literal.len() >= size {
            break;
        }
        literal.extend_from_slice(line);
    }
    literal.truncate(size);
    Some(literal)
}

/// Quote a string for an IMAP command.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── Session ─────────────────────────────────────────────────────────

/// Error type for IMAP session operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

/// Minimal tagged-command IMAP session over any byte stream.
struct ImapSession<S: Read + Write> {
    stream: S,
    tag_counter: u32,
}

impl<S: Read + Write> ImapSession<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            tag_counter: 1,
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "IMAP connection closed",
                    )
                    .into());
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn greeting(&mut self) -> Result<(), ImapError> {
        let line = self.read_line()?;
        if line.starts_with(b"* OK") || line.starts_with(b"* PREAUTH") {
            Ok(())
        } else {
            Err(format!("unexpected IMAP greeting: {}", String::from_utf8_lossy(&line).trim_end()).into())
        }
    }

    /// Send a command; return all response lines, the tagged status last.
    fn command(&mut self, cmd: &str) -> Result<Vec<Vec<u8>>, ImapError> {
        let tag = format!("A{}", self.tag_counter);
        self.tag_counter += 1;

        self.stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.stream.flush()?;

        let tagged = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(tagged.as_bytes());
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    /// Like [`command`](Self::command) but fails unless the status is OK.
    fn command_ok(&mut self, cmd: &str, what: &str) -> Result<Vec<Vec<u8>>, ImapError> {
        let lines = self.command(cmd)?;
        let ok = lines.last().is_some_and(|l| {
            String::from_utf8_lossy(l)
                .split_whitespace()
                .nth(1)
                .is_some_and(|s| s.eq_ignore_ascii_case("OK"))
        });
        if ok {
            Ok(lines)
        } else {
            let status = lines
                .last()
                .map(|l| String::from_utf8_lossy(l).trim_end().to_string())
                .unwrap_or_default();
            Err(format!("IMAP {what} failed: {status}").into())
        }
    }

    fn login(&mut self, username: &str, password: &SecretString) -> Result<(), ImapError> {
        self.command_ok(
            &format!("LOGIN {} {}", quote(username), quote(password.expose_secret())),
            "login",
        )?;
        Ok(())
    }

    fn select(&mut self, folder: &str) -> Result<(), ImapError> {
        self.command_ok(&format!("SELECT {}", quote(folder)), "select")?;
        Ok(())
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, ImapError> {
        let lines = self.command_ok("SEARCH UNSEEN", "search")?;
        Ok(parse_search(&lines))
    }

    fn fetch_headers(&mut self, seq: u32) -> Result<Option<Vec<u8>>, ImapError> {
        let lines = self.command_ok(
            &format!("FETCH {seq} (BODY.PEEK[HEADER.FIELDS (FROM SUBJECT MESSAGE-ID)])"),
            "fetch",
        )?;
        Ok(extract_literal(&lines))
    }

    fn mark_seen(&mut self, seq: u32) -> Result<(), ImapError> {
        self.command_ok(&format!("STORE {seq} +FLAGS (\\Seen)"), "store")?;
        Ok(())
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }

    /// Fetch unseen mails in `folder`, marking seen only those that parsed.
    ///
    /// A failed FETCH leaves that mail unseen for the next poll. A dead
    /// connection ends the pass early; mails collected so far are returned.
    fn fetch_unseen(
        &mut self,
        username: &str,
        password: &SecretString,
        folder: &str,
    ) -> Result<Vec<FetchedMail>, ImapError> {
        self.greeting()?;
        self.login(username, password)?;
        self.select(folder)?;

        let mut results = Vec::new();
        for seq in self.search_unseen()? {
            let raw = match self.fetch_headers(seq) {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    warn!(seq, "FETCH returned no usable header literal");
                    continue;
                }
                Err(e) if is_connection_error(&*e) => {
                    error!(seq, "IMAP connection lost during fetch: {e}");
                    return Ok(results);
                }
                Err(e) => {
                    warn!(seq, "Failed to fetch mail headers: {e}");
                    continue;
                }
            };
            let Some(mail) = parse_headers(&raw) else {
                warn!(seq, "Could not parse mail headers");
                continue;
            };
            results.push(mail);

            match self.mark_seen(seq) {
                Ok(()) => {}
                Err(e) if is_connection_error(&*e) => {
                    error!(seq, "IMAP connection lost while marking seen: {e}");
                    return Ok(results);
                }
                Err(e) => warn!(seq, "Failed to mark mail as seen: {e}"),
            }
        }

        self.logout();
        Ok(results)
    }
}

/// Socket-level failures end the session; tagged `NO`/`BAD` replies do not.
fn is_connection_error(e: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    e.downcast_ref::<std::io::Error>().is_some()
}

/// Fetch unseen mails over TLS (blocking, run in spawn_blocking).
fn fetch_unseen_imap(config: &ImapConfig) -> Result<Vec<FetchedMail>, ImapError> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port))?;
    tcp.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    tcp.set_write_timeout(Some(SOCKET_TIMEOUT))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(config.host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let tls = rustls::StreamOwned::new(conn, tcp);

    ImapSession::new(tls).fetch_unseen(&config.username, &config.password, &config.folder)
}

// ── Source ──────────────────────────────────────────────────────────

/// Recently relayed Message-IDs, oldest evicted first.
#[derive(Debug)]
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record `msg_id`; false if it is already remembered.
    fn insert(&mut self, msg_id: &str) -> bool {
        if !self.ids.insert(msg_id.to_string()) {
            return false;
        }
        self.order.push_back(msg_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Mailbox poller.
pub struct ImapSource {
    config: ImapConfig,
    seen_messages: Arc<Mutex<SeenIds>>,
    shutdown: watch::Sender<bool>,
}

impl ImapSource {
    pub fn new(config: ImapConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            seen_messages: Arc::new(Mutex::new(SeenIds::with_capacity(SEEN_CAPACITY))),
            shutdown,
        }
    }

    pub fn config(&self) -> &ImapConfig {
        &self.config
    }
}

/// Record `msg_id` as emitted; false if it was already.
fn first_sighting(seen: &Mutex<SeenIds>, msg_id: &str) -> bool {
    let mut guard = seen.lock().unwrap_or_else(|e| e.into_inner());
    guard.insert(msg_id)
}

#[async_trait]
impl EventSource for ImapSource {
    type Event = MailEvent;

    fn name(&self) -> &str {
        "imap"
    }

    async fn start(&self) -> Result<EventStream<MailEvent>, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let seen = Arc::clone(&self.seen_messages);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!(
                host = %config.host,
                folder = %config.folder,
                "Mail poller started, polling every {}ms",
                config.poll_interval.as_millis()
            );

            let mut tick = tokio::time::interval(config.poll_interval);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        info!("Mail poller shutting down");
                        return;
                    }
                    _ = tick.tick() => {}
                }

                let cfg = config.clone();
                let messages = match tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg)).await {
                    Ok(Ok(messages)) => messages,
                    Ok(Err(e)) => {
                        error!("Mail poll failed: {e}");
                        continue;
                    }
                    Err(e) => {
                        error!("Mail poll task panicked: {e}");
                        continue;
                    }
                };

                if !messages.is_empty() {
                    debug!("Fetched {} unseen mails", messages.len());
                }

                for (msg_id, event) in messages {
                    if !first_sighting(&seen, &msg_id) {
                        debug!(msg_id = %msg_id, "Skipping already relayed mail");
                        continue;
                    }
                    if tx.send(event).is_err() {
                        info!("Mail event receiver closed");
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        info!("Mail channel shutting down");
        self.shutdown.send_replace(true);
        Ok(())
    }
}
