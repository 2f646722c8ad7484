//! Relay coordinator: fans the IRC and mail streams into one sink.
//!
//! Each source is consumed in its own task so a slow delivery on one side
//! never holds up intake on the other. Within a source, events are handled
//! in arrival order and each delivery is awaited before the next event.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channels::{EventSource, EventStream};
use crate::config::RelayConfig;
use crate::error::Error;
use crate::pipeline::normalize::{normalize_irc, normalize_mail};
use crate::pipeline::rules::TagRules;
use crate::pipeline::types::{InboundEvent, IrcEvent, MailEvent, Notification, RelayStats};
use crate::sink::NotificationSink;

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Delivered,
    Failed,
}

/// Stateless routing shared by both source loops.
pub struct Dispatcher {
    address_prefix: String,
    mail_rules: TagRules,
    sink: Arc<dyn NotificationSink>,
}

impl Dispatcher {
    pub fn new(
        address_prefix: impl Into<String>,
        mail_rules: TagRules,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            address_prefix: address_prefix.into(),
            mail_rules,
            sink,
        }
    }

    pub fn from_config(config: &RelayConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self::new(
            config.irc.message_prefix.clone(),
            config.mail_rules.clone(),
            sink,
        )
    }

    /// Normalize an event; `None` means it is not for us.
    pub fn normalize(&self, event: &InboundEvent) -> Option<Notification> {
        match event {
            InboundEvent::Irc(irc) => normalize_irc(irc, &self.address_prefix),
            InboundEvent::Mail(mail) => Some(normalize_mail(mail, &self.mail_rules)),
        }
    }

    /// Normalize, format and deliver one event. Failures are logged, never raised.
    pub async fn handle(&self, event: InboundEvent) -> Outcome {
        let source = event.source();
        let Some(notification) = self.normalize(&event) else {
            return Outcome::Skipped;
        };

        let payload = notification.to_payload();
        debug!(
            source,
            author = %notification.author,
            tags = %notification.tags_csv(),
            "Relaying notification"
        );

        match self.sink.deliver(&payload).await {
            Ok(receipt) => {
                debug!(source, status = receipt.status, sink = self.sink.name(), "Notification delivered");
                Outcome::Delivered
            }
            Err(e) => {
                error!(source, sink = self.sink.name(), error = %e, "Notification delivery failed");
                Outcome::Failed
            }
        }
    }
}

/// Drain one source stream until it ends or shutdown is signalled.
async fn pump<E>(
    name: &'static str,
    mut stream: EventStream<E>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> RelayStats
where
    E: Into<InboundEvent> + Send + 'static,
{
    let mut stats = RelayStats::default();
    info!(source = name, "Relay loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let event = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    debug!(source = name, "Shutdown sender dropped");
                }
                break;
            }
            event = stream.next() => match event {
                Some(event) => event,
                None => {
                    info!(source = name, "Source stream ended");
                    break;
                }
            },
        };

        stats.received += 1;
        match dispatcher.handle(event.into()).await {
            Outcome::Skipped => stats.skipped += 1,
            Outcome::Delivered => stats.delivered += 1,
            Outcome::Failed => stats.failed += 1,
        }
    }

    info!(
        source = name,
        received = stats.received,
        skipped = stats.skipped,
        delivered = stats.delivered,
        failed = stats.failed,
        "Relay loop stopped"
    );
    stats
}

/// Flip `shutdown` to true once `signal` resolves.
///
/// If the signal cannot be awaited the error is logged and the relay keeps
/// running. The caller holds its own handle on the sender so the relay never
/// sees it dropped.
pub async fn shutdown_on_signal<F>(signal: F, shutdown: Arc<watch::Sender<bool>>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received");
            shutdown.send_replace(true);
        }
        Err(e) => error!("Failed to listen for shutdown signal, relay keeps running: {e}"),
    }
}

/// Wires an IRC source and a mail source into the dispatcher.
pub struct Relay<I, M> {
    irc: I,
    mail: M,
    dispatcher: Arc<Dispatcher>,
}

impl<I, M> Relay<I, M>
where
    I: EventSource<Event = IrcEvent>,
    M: EventSource<Event = MailEvent>,
{
    pub fn new(irc: I, mail: M, dispatcher: Dispatcher) -> Self {
        Self {
            irc,
            mail,
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Run both loops until their streams end or `shutdown` flips to true.
    ///
    /// In-flight deliveries finish before the loops exit. Sources are shut
    /// down afterwards.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<RelayStats, Error> {
        let irc_stream = self.irc.start().await?;
        let mail_stream = match self.mail.start().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.irc.shutdown().await;
                return Err(e.into());
            }
        };
        info!(irc = self.irc.name(), mail = self.mail.name(), "Relay running");

        let irc_task = tokio::spawn(pump(
            "irc",
            irc_stream,
            Arc::clone(&self.dispatcher),
            shutdown.clone(),
        ));
        let mail_task = tokio::spawn(pump(
            "mail",
            mail_stream,
            Arc::clone(&self.dispatcher),
            shutdown,
        ));

        let (irc_stats, mail_stats) = tokio::join!(irc_task, mail_task);
        let irc_stats = irc_stats.unwrap_or_else(|e| {
            error!("IRC relay task panicked: {e}");
            RelayStats::default()
        });
        let mail_stats = mail_stats.unwrap_or_else(|e| {
            error!("Mail relay task panicked: {e}");
            RelayStats::default()
        });

        if let Err(e) = self.irc.shutdown().await {
            warn!("IRC source shutdown failed: {e}");
        }
        if let Err(e) = self.mail.shutdown().await {
            warn!("Mail source shutdown failed: {e}");
        }

        Ok(irc_stats.merge(mail_stats))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{ChannelError, DeliveryError};
    use crate::pipeline::types::{DeliveryReceipt, OutboundPayload};

    /// Source that replays a fixed list of events, then ends.
    struct ReplaySource<E> {
        name: &'static str,
        events: Mutex<Option<Vec<E>>>,
        shutdowns: AtomicUsize,
    }

    impl<E> ReplaySource<E> {
        fn new(name: &'static str, events: Vec<E>) -> Self {
            Self {
                name,
                events: Mutex::new(Some(events)),
                shutdowns: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl<E: Send + 'static> EventSource for ReplaySource<E> {
        type Event = E;

        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self) -> Result<EventStream<E>, ChannelError> {
            let events = self.events.lock().unwrap().take().unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(events)))
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Source that never yields anything.
    struct IdleSource;

    #[async_trait]
    impl EventSource for IdleSource {
        type Event = MailEvent;

        fn name(&self) -> &str {
            "idle"
        }

        async fn start(&self) -> Result<EventStream<MailEvent>, ChannelError> {
            Ok(Box::pin(futures::stream::pending()))
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    /// Source whose start always fails.
    struct BrokenSource;

    #[async_trait]
    impl EventSource for BrokenSource {
        type Event = MailEvent;

        fn name(&self) -> &str {
            "broken"
        }

        async fn start(&self) -> Result<EventStream<MailEvent>, ChannelError> {
            Err(ChannelError::StartupFailed {
                name: "broken".into(),
                reason: "no route to host".into(),
            })
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    /// Records payloads; fails any payload containing `fail_marker`.
    #[derive(Default)]
    struct RecordingSink {
        payloads: Mutex<Vec<String>>,
        fail_marker: Option<&'static str>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, payload: &OutboundPayload) -> Result<DeliveryReceipt, DeliveryError> {
            self.payloads.lock().unwrap().push(payload.to_string());
            if self.fail_marker.is_some_and(|m| payload.as_str().contains(m)) {
                return Err(DeliveryError::Transport {
                    room_id: "42".into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(DeliveryReceipt {
                status: 200,
                body: r#"{"status":"sent"}"#.into(),
            })
        }
    }

    fn dispatcher(sink: Arc<RecordingSink>) -> Dispatcher {
        Dispatcher::new("camelbot:", TagRules::default_rules(), sink)
    }

    fn irc(msg: &str) -> IrcEvent {
        IrcEvent::new(msg, "felix", "host", "#flurfunk")
    }

    #[tokio::test]
    async fn skipped_irc_event_is_not_delivered() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(Arc::clone(&sink));
        assert_eq!(d.handle(irc("no prefix here").into()).await, Outcome::Skipped);
        assert!(sink.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn accepted_irc_event_is_delivered_once() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(Arc::clone(&sink));
        assert_eq!(d.handle(irc("camelbot: build is green").into()).await, Outcome::Delivered);
        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(
            *payloads,
            vec!["<message channels='irc' author='felix'><![CDATA[Chatted on #flurfunk\nbuild is green]]></message>"]
        );
    }

    #[tokio::test]
    async fn every_mail_event_is_delivered() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(Arc::clone(&sink));
        for subject in ["[commits] fix bug", "Hello", ""] {
            let outcome = d.handle(MailEvent::new("ci@example.com", subject).into()).await;
            assert_eq!(outcome, Outcome::Delivered);
        }
        assert_eq!(sink.payloads.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn relay_routes_both_sources_and_survives_failures() {
        let sink = Arc::new(RecordingSink {
            fail_marker: Some("explode"),
            ..Default::default()
        });
        let irc_source = ReplaySource::new(
            "irc",
            vec![
                irc("camelbot: explode please"),
                irc("unrelated chatter"),
                irc("camelbot: still here"),
            ],
        );
        let mail_source = ReplaySource::new(
            "mail",
            vec![
                MailEvent::new("ci@example.com", "[commits] fix bug"),
                MailEvent::new("nagios@example.com", "Service Alert [commits]"),
            ],
        );

        let relay = Relay::new(irc_source, mail_source, dispatcher(Arc::clone(&sink)));
        let (_tx, rx) = watch::channel(false);
        let stats = tokio::time::timeout(Duration::from_secs(5), relay.run(rx))
            .await
            .expect("relay timed out")
            .unwrap();

        assert_eq!(
            stats,
            RelayStats { received: 5, skipped: 1, delivered: 3, failed: 1 }
        );

        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 4);
        assert!(payloads.iter().any(|p| p.contains("still here")));
        assert!(payloads.iter().any(|p| p.contains("channels='commits,nagios'")));

        assert_eq!(relay.irc.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(relay.mail.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn irc_order_is_preserved_within_source() {
        let sink = Arc::new(RecordingSink::default());
        let events: Vec<IrcEvent> = (0..10).map(|i| irc(&format!("camelbot: msg {i}"))).collect();
        let relay = Relay::new(
            ReplaySource::new("irc", events),
            ReplaySource::<MailEvent>::new("mail", vec![]),
            dispatcher(Arc::clone(&sink)),
        );
        let (_tx, rx) = watch::channel(false);
        relay.run(rx).await.unwrap();

        let payloads = sink.payloads.lock().unwrap();
        for (i, p) in payloads.iter().enumerate() {
            assert!(p.contains(&format!("msg {i}]]>")));
        }
    }

    #[tokio::test]
    async fn shutdown_signal_stops_idle_loops() {
        let sink = Arc::new(RecordingSink::default());
        let relay = Arc::new(Relay::new(
            ReplaySource::new("irc", vec![irc("camelbot: hi")]),
            IdleSource,
            dispatcher(Arc::clone(&sink)),
        ));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);

        let stats = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn signal_error_does_not_stop_the_relay() {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);

        shutdown_on_signal(
            async { Err(std::io::Error::other("no signal handler")) },
            Arc::clone(&tx),
        )
        .await;

        assert!(!*rx.borrow());
        // Sender still alive: no change is pending and none has failed.
        assert!(!rx.has_changed().unwrap());

        let sink = Arc::new(RecordingSink::default());
        let relay = Arc::new(Relay::new(
            ReplaySource::new("irc", vec![irc("camelbot: hi")]),
            IdleSource,
            dispatcher(Arc::clone(&sink)),
        ));
        let runner = {
            let relay = Arc::clone(&relay);
            let rx = rx.clone();
            tokio::spawn(async move { relay.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!runner.is_finished());

        tx.send_replace(true);
        let stats = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn signal_flips_shutdown() {
        let (tx, rx) = watch::channel(false);
        shutdown_on_signal(async { Ok(()) }, Arc::new(tx)).await;
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn failing_source_start_is_reported_and_other_source_stopped() {
        let sink = Arc::new(RecordingSink::default());
        let relay = Relay::new(
            ReplaySource::<IrcEvent>::new("irc", vec![]),
            BrokenSource,
            dispatcher(sink),
        );
        let (_tx, rx) = watch::channel(false);
        let err = relay.run(rx).await.unwrap_err();
        assert!(matches!(err, Error::Channel(ChannelError::StartupFailed { .. })));
        assert_eq!(relay.irc.shutdowns.load(Ordering::SeqCst), 1);
    }
}
