//! garlicd - Garlic session daemon
//!
//! Runs a set of local identities over the in-process tunnel network,
//! optionally exchanging demo traffic between them.

use anyhow::Context;
use clap::Parser;
use garlicd::config::Config;
use garlicd::identity::{AppMessage, Collaborators, LocalIdentity};
use garlicd::keys::NodeKeys;
use garlicd::loopback::LoopbackNetwork;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("garlicd=info".parse()?);
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    if let Err(e) = init_logging(config.json_logs()) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "garlicd v{} - Garlic Session Daemon",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(config).await {
        error!("garlicd failed: {:#}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let session_config = config.session_config()?;
    info!(
        "Resend interval {}s, window {}s, refill {} tags at {}",
        session_config.resend_interval_secs,
        session_config.window_lifetime_secs,
        session_config.refill_batch,
        session_config.low_watermark
    );

    let network = LoopbackNetwork::new();
    let mut identities = Vec::with_capacity(config.identities);
    for index in 0..config.identities {
        let path = config.key_path(index);
        let keys = NodeKeys::load_or_generate(&path)
            .with_context(|| format!("Loading keys from {}", path.display()))?;

        let (port, deliveries) = network.attach(keys.identity, keys.encryption.public.clone());
        let port = Arc::new(port);
        let (identity, channels) = LocalIdentity::new(
            &keys,
            session_config.clone(),
            Collaborators {
                keys: port.clone(),
                replies: port.clone(),
                transport: port.clone(),
                forwarder: Some(port),
            },
        );
        let app = identity.start(channels);
        identity.attach_network(deliveries);
        tokio::spawn(log_app_messages(identity.clone(), app));
        info!("Identity {} online", identity.ident());
        identities.push(identity);
    }

    let demo = config.demo.then(|| {
        tokio::spawn(demo_traffic(
            identities.clone(),
            Duration::from_secs(config.demo_interval_secs),
            config.explicit_ack,
        ))
    });

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for shutdown signal")?;
    info!("Received shutdown signal");

    if let Some(handle) = demo {
        handle.abort();
    }
    for identity in &identities {
        let stats = identity.stats();
        info!(
            "{}: {} peers, {} usable tags, {} resends, {} resets, {} delivered",
            identity.ident(),
            stats.sessions.peers,
            stats.sessions.usable_tags,
            stats.sessions.resends,
            stats.sessions.resets,
            stats.delivered_local
        );
        identity.shutdown();
    }
    info!(
        "Loopback network delivered {} messages, lost {}",
        network.delivered(),
        network.lost()
    );
    Ok(())
}

async fn log_app_messages(identity: Arc<LocalIdentity>, mut app: mpsc::UnboundedReceiver<AppMessage>) {
    while let Some(message) = app.recv().await {
        info!(
            "{} received message {:#010x}: {}",
            identity.ident(),
            message.message_id,
            String::from_utf8_lossy(&message.payload)
        );
    }
}

async fn demo_traffic(identities: Vec<Arc<LocalIdentity>>, every: Duration, explicit_ack: bool) {
    let mut ticker = interval(every);
    let mut sequence: u64 = 0;
    loop {
        ticker.tick().await;
        sequence += 1;
        let sender = &identities[0];
        for receiver in &identities[1..] {
            let body = format!("demo message {sequence} from {}", sender.ident());
            match sender.send_data(receiver.ident(), body.into_bytes(), explicit_ack) {
                Ok(result) => info!(
                    "Sent #{} to {} via {:?} ({} tags left)",
                    sequence,
                    receiver.ident(),
                    result.key_type,
                    result.tags_remaining
                ),
                Err(e) => warn!("Send to {} failed: {}", receiver.ident(), e),
            }
        }
    }
}
