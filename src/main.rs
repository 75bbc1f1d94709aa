use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spacelink::bridge::{
    AgentBridge, BridgeDeps, BridgeOptions, DecodingSinkFactory, LocalConnector, RtcPeerFactory,
    SignalingConnector, WsConnector,
};
use spacelink::config::ConfigStore;
use spacelink::events::EventBus;
use spacelink::media::Base64ImageDecoder;
use spacelink::membership::SqliteMembershipStore;
use spacelink::monitor::InMemoryStreamMonitor;
use spacelink::signaling::SpaceRegistry;
use spacelink::state::AppState;
use spacelink::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// spacelink command line arguments
#[derive(Parser, Debug)]
#[command(name = "spacelink")]
#[command(version, about = "Signaling relay and agent media bridge for shared spaces", long_about = None)]
struct CliArgs {
    /// Listen address (overrides database config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides database config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Data directory path (default: /var/lib/spacelink)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting spacelink v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg takes precedence
    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let db_path = data_dir.join("spacelink.db");
    let config_store = ConfigStore::new(&db_path).await?;
    let mut config = (*config_store.get()).clone();

    // Apply CLI argument overrides to config (only if explicitly specified)
    if let Some(addr) = args.address {
        config.web.bind_address = addr;
    }
    if let Some(port) = args.port {
        config.web.http_port = port;
    }

    let ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(ip, config.web.http_port);

    // Membership shares the configuration database
    SqliteMembershipStore::init_schema(config_store.pool()).await?;
    let membership = Arc::new(SqliteMembershipStore::new(config_store.pool().clone()));

    let registry = Arc::new(SpaceRegistry::with_membership(membership));
    let events = Arc::new(EventBus::new());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Agent bridge
    let sinks = video_sinks();
    let video_codecs = sinks.video_codecs();
    let mut peers = RtcPeerFactory::new(config.webrtc.clone());
    if video_codecs.is_empty() {
        tracing::warn!("No video decoder built in, inbound video tracks will not be decoded");
    } else {
        tracing::info!("Video decoders: {}", video_codecs.join(", "));
        peers = peers.with_video_codecs(video_codecs);
    }
    let deps = BridgeDeps {
        peers: Arc::new(peers),
        sinks: Arc::new(sinks),
        monitor: Arc::new(InMemoryStreamMonitor::new()),
    };
    let options = BridgeOptions::from(&config.bridge);
    let bridge = match config.bridge.signaling_url.as_deref() {
        Some(url) if !url.is_empty() => {
            tracing::info!("Agent bridge uses remote signaling at {}", url);
            let connector: Arc<dyn SignalingConnector> = Arc::new(WsConnector::new(url));
            AgentBridge::new(connector, deps, Arc::new(Base64ImageDecoder), options)
        }
        _ => {
            tracing::info!("Agent bridge attached to the local registry");
            let connector: Arc<dyn SignalingConnector> = Arc::new(LocalConnector::new(
                registry.clone(),
                events.clone(),
                config.signaling.enforce_membership,
            ));
            AgentBridge::new(connector, deps, Arc::new(Base64ImageDecoder), options)
                .with_registry(registry.clone())
        }
    };
    let bridge = Arc::new(bridge);
    let capture_listener = bridge.spawn_capture_listener(&events);

    let state = AppState::new(config_store, registry, bridge, events, shutdown_tx.clone());

    let app = web::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    cleanup(&state).await;
    capture_listener.abort();

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "spacelink=error,tower_http=error",
        LogLevel::Warn => "spacelink=warn,tower_http=warn",
        LogLevel::Info => "spacelink=info,tower_http=info",
        LogLevel::Verbose => "spacelink=debug,tower_http=info",
        LogLevel::Debug => "spacelink=debug,tower_http=debug",
        LogLevel::Trace => "spacelink=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Sink factory with every video decoder enabled at build time
fn video_sinks() -> DecodingSinkFactory {
    let sinks = DecodingSinkFactory::new();
    #[cfg(feature = "h264")]
    let sinks = sinks.with_video_decoder(
        spacelink::bridge::h264::MIME_TYPE_H264,
        spacelink::bridge::OpenH264Decoder::factory(),
    );
    sinks
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("SPACELINK_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("/var/lib/spacelink")
}

/// Leave every joined space and release peer connections
async fn cleanup(state: &Arc<AppState>) {
    state.bridge.shutdown().await;
    tracing::info!(
        "Agent bridge closed, {} space(s) still tracked",
        state.registry.space_count()
    );
}
