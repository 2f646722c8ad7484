use std::sync::Arc;

use relaybot::channels::{ImapSource, IrcSource};
use relaybot::config::RelayConfig;
use relaybot::pipeline::relay::{Dispatcher, Relay, shutdown_on_signal};
use relaybot::sink::{HipChatSink, NotificationSink};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📣 relaybot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   IRC: {}:{} {} as {} (prefix {:?})",
        config.irc.server,
        config.irc.port,
        config.irc.channel,
        config.irc.nickname,
        config.irc.message_prefix
    );
    eprintln!(
        "   IMAP: {}@{}:{} every {:?}",
        config.imap.username, config.imap.host, config.imap.port, config.imap.poll_interval
    );
    eprintln!(
        "   Chat: {} room {} as {}",
        config.chat.api_url, config.chat.room_id, config.chat.bot_name
    );
    eprintln!("   Mail rules: {}\n", config.mail_rules.rules().len());

    let sink: Arc<dyn NotificationSink> = Arc::new(HipChatSink::new(config.chat.clone())?);
    let dispatcher = Dispatcher::from_config(&config, sink);
    let relay = Relay::new(
        IrcSource::new(config.irc.clone()),
        ImapSource::new(config.imap.clone()),
        dispatcher,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    tokio::spawn(shutdown_on_signal(
        tokio::signal::ctrl_c(),
        Arc::clone(&shutdown_tx),
    ));

    let stats = relay.run(shutdown_rx).await?;
    drop(shutdown_tx);
    tracing::info!(
        received = stats.received,
        skipped = stats.skipped,
        delivered = stats.delivered,
        failed = stats.failed,
        "Relay stopped"
    );
    Ok(())
}
