//! chatmux-relay - unified live chat relay
//!
//! Runs one harvester per configured chat URL, stores every message, and streams
//! enriched messages to WebSocket viewers. With the tailer enabled it also
//! broadcasts rows written to the same database by other relay processes.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatmux_common::chat::Enricher;
use chatmux_common::config::{RelayConfig, StorageMode};
use chatmux_common::db::Database;
use chatmux_relay::hub::BroadcastHub;
use chatmux_relay::ingest::{IngestSupervisor, LineSink};
use chatmux_relay::tailer::{ChangeTailer, SeenIds};
use chatmux_relay::{build_router, AppState, ChatRelay};

/// Command-line arguments for chatmux-relay
///
/// Every flag overrides the matching config file value.
#[derive(Parser, Debug)]
#[command(name = "chatmux-relay")]
#[command(about = "Unified live chat relay")]
#[command(version)]
struct Args {
    /// Config file (default: user config dir, then /etc/chatmux)
    #[arg(short, long, env = "CHATMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CHATMUX_PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "CHATMUX_BIND")]
    bind: Option<String>,

    /// ephemeral | persistent
    #[arg(long, env = "CHATMUX_DB_MODE")]
    db_mode: Option<StorageMode>,

    /// Database file (required for persistent mode)
    #[arg(long, env = "CHATMUX_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Comma-separated chat URLs to harvest
    #[arg(long, env = "CHAT_URLS", value_delimiter = ',')]
    chat_urls: Vec<String>,

    /// Harvester executable
    #[arg(long, env = "CHATMUX_HARVESTER_BIN")]
    harvester_bin: Option<String>,

    /// Broadcast rows written by other processes
    #[arg(long, env = "CHATMUX_TAILER_ENABLED")]
    tailer: Option<bool>,
}

impl Args {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind_addr = bind;
        }
        if let Some(mode) = self.db_mode {
            config.storage.mode = mode;
        }
        if let Some(path) = self.db_path {
            config.storage.path = Some(path);
        }
        if !self.chat_urls.is_empty() {
            config.ingest.chat_urls = self.chat_urls;
        }
        if let Some(bin) = self.harvester_bin {
            config.ingest.bin = bin;
        }
        if let Some(enabled) = self.tailer {
            config.tailer.enabled = enabled;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatmux_relay=info,chatmux_common=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting chatmux-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.normalize().context("Invalid configuration")?;
    let config = Arc::new(config);

    let db = Database::open(&config.storage)
        .await
        .context("Failed to open message store")?;

    let enricher = Arc::new(Enricher::from_config(&config.chat));
    if let Some(path) = &config.chat.emotes_file {
        if let Err(e) = enricher.emotes().load_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to preload emotes");
        }
    }

    let hub = Arc::new(BroadcastHub::new(config.websocket.queue_capacity));
    let seen = Arc::new(SeenIds::default());
    let relay = Arc::new(ChatRelay::new(db.clone(), enricher.clone(), hub.clone(), seen.clone()));
    let shutdown = CancellationToken::new();

    let tailer = if config.tailer.enabled {
        let tailer = ChangeTailer::new(db.clone(), enricher.clone(), hub.clone(), seen, config.tailer.clone());
        Some(tailer.spawn(shutdown.child_token()))
    } else {
        None
    };

    let sink: Arc<dyn LineSink> = relay.clone();
    let supervisor = IngestSupervisor::new(&config.ingest, sink, shutdown.clone());
    let started = supervisor.spawn_all(&config.ingest.chat_urls);
    if started == 0 {
        warn!("No chat URLs configured; only tailed messages will be relayed");
    }

    let app = build_router(AppState::new(relay, config.clone(), shutdown.clone()));
    let ip: IpAddr = config
        .server
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind_addr))?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);

    tokio::spawn(watch_signals(shutdown.clone()));
    let serve_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await;

    // Teardown runs even if the server failed
    shutdown.cancel();
    let grace = config.server.shutdown_grace();
    supervisor.shutdown(grace).await;
    if let Some(tailer) = tailer {
        tailer.join(grace).await;
    }
    hub.close_all();
    if let Err(e) = db.close().await {
        error!(error = %e, "Failed to close message store");
    }

    served.context("Server error")?;
    info!("Shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
