use anyhow::Context as _;
use clap::Parser;
use mcp_relay::client::ClientDeps;
use mcp_relay::credentials::SessionCredentialStore;
use mcp_relay::events::EventBus;
use mcp_relay::oauth::HttpOAuthFlow;
use mcp_relay::store::{FileStore, MemoryStore, SessionStore, SqliteStore};
use mcp_relay::transport::StreamableHttpTransport;
use mcp_relay_server::config::{self, BackendConfig, RelayConfig};
use mcp_relay_server::http::{self, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Background expired-session sweep interval.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-relay-server")]
#[command(
    version,
    about = "MCP session relay: durable remote-endpoint sessions + aggregation + event push"
)]
struct CliArgs {
    /// Path to a relay config file (YAML).
    #[arg(short = 'c', long = "config", env = "MCP_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address (ip:port).
    #[arg(short = 'b', long, env = "MCP_RELAY_BIND", default_value = "127.0.0.1:4200")]
    bind: String,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "MCP_RELAY_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting MCP session relay v{VERSION}");
    run(args).await
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = load_config(&args).await?;
    let store = build_store(&config.backend).await?;

    // Graceful shutdown coordination for all long-lived tasks.
    let ct = CancellationToken::new();
    spawn_shutdown_watcher(ct.clone());
    spawn_cleanup_task(Arc::clone(&store), ct.clone());

    let http_client = build_no_redirect_http_client("relay HTTP client")?;
    let deps = ClientDeps {
        credentials: Arc::new(SessionCredentialStore::new(Arc::clone(&store))),
        store,
        oauth: Arc::new(HttpOAuthFlow::new(http_client)),
        transport: Arc::new(StreamableHttpTransport::new(reqwest::Client::new())),
        events: Arc::new(EventBus::default()),
        ttl_secs: Some(config.session_ttl_secs),
    };

    let state = Arc::new(AppState::new(
        deps,
        Duration::from_secs(config.heartbeat_secs),
        config.callback_url.clone(),
    ));
    let app = http::router(state);

    let addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("parse bind address '{}'", args.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind address '{addr}'"))?;
    let bound = listener.local_addr().context("get bind address")?;
    tracing::info!("Starting relay HTTP server on {bound}");

    let serve_ct = ct.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            serve_ct.cancelled().await;
        })
        .await?;

    tracing::info!("Relay shut down gracefully");
    Ok(())
}

async fn load_config(args: &CliArgs) -> anyhow::Result<RelayConfig> {
    match &args.config {
        Some(path) => {
            let config = config::load(path).await?;
            tracing::info!(path = %path.display(), "Loaded config file");
            Ok(config)
        }
        None => {
            tracing::info!("No config file given; using defaults (memory backend)");
            Ok(RelayConfig::default())
        }
    }
}

async fn build_store(backend: &BackendConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    match backend {
        BackendConfig::Memory => {
            tracing::info!("Session store: memory (volatile)");
            Ok(Arc::new(MemoryStore::new()))
        }
        BackendConfig::File { path } => {
            tracing::info!(path = %path.display(), "Session store: file");
            let store = FileStore::open(path.clone())
                .await
                .with_context(|| format!("open session file '{}'", path.display()))?;
            Ok(Arc::new(store))
        }
        BackendConfig::Sqlite { url } => {
            tracing::info!("Session store: sqlite");
            let store = SqliteStore::connect(url)
                .await
                .context("connect session database")?;
            Ok(Arc::new(store))
        }
    }
}

fn spawn_cleanup_task(store: Arc<dyn SessionStore>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match store.cleanup_expired_sessions().await {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::info!(removed, "expired sessions swept");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "session cleanup tick failed");
                        }
                    }
                }
            }
        }
    });
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

/// OAuth redirects must be surfaced to the user, never followed.
fn build_no_redirect_http_client(label: &'static str) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .with_context(|| format!("build {label}"))
}

fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Check if stdout is a TTY for format selection.
    let is_tty = atty::is(atty::Stream::Stdout);

    if is_tty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
