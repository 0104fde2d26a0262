//! tether daemon: a persistent-connection TCP messaging server.
//!
//! Listens for long-lived client connections, logs connection and message
//! events, and answers sync requests with a canned reply. Intended both as
//! a usable daemon and as the reference embedding of the server library.

mod config;
mod logging;

use anyhow::Result;
use clap::Parser;
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tether_session::{DisconnectReason, Envelope, ReplyHandler, Server, ServerEventHandler};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Persistent-connection TCP messaging daemon")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long)]
    bind: Option<String>,

    /// Preshared key clients must present, overrides the config file
    #[arg(long)]
    preshared_key: Option<String>,

    /// Idle session cutoff (humantime, e.g. "5m"), overrides the config file
    #[arg(long)]
    idle_timeout: Option<String>,

    /// Default log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

/// Logs every server event.
struct LogObserver;

impl ServerEventHandler for LogObserver {
    fn client_connected(&self, peer: &str) {
        info!(%peer, "client connected");
    }

    fn client_disconnected(&self, peer: &str, reason: DisconnectReason) {
        info!(%peer, %reason, "client disconnected");
    }

    fn message_received(&self, peer: &str, envelope: &Envelope) {
        let text = envelope
            .payload
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();
        info!(%peer, bytes = envelope.payload_len(), "message: {text}");
    }
}

/// Answers every sync request with a fixed demonstration reply.
struct CannedReplies;

impl ReplyHandler for CannedReplies {
    fn handle(&self, peer: &str, request: Envelope) -> Result<Envelope> {
        info!(%peer, bytes = request.payload_len(), "sync request");
        Ok(Envelope::new("Here is your response!")
            .with_metadata("foo", b"bar".to_vec())
            .with_metadata("bar", b"baz".to_vec()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(key) = args.preshared_key {
        config.preshared_key = Some(key);
    }
    if let Some(idle) = args.idle_timeout {
        config.idle_timeout = Some(idle);
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    logging::init(&config.log_level);

    let server_config = config.to_server_config()?;
    info!(
        bind_addr = %server_config.bind_addr,
        psk = server_config.preshared_key.is_some(),
        "starting tether"
    );

    let server = Arc::new(Server::new(server_config));
    server.register_observer(Arc::new(LogObserver));
    server.set_reply_handler(Arc::new(CannedReplies));
    server.start().await?;

    if let Some(addr) = server.local_addr() {
        info!(%addr, "listening");
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    info!("final stats: {}", server.stats());
    server.dispose().await;

    Ok(())
}
