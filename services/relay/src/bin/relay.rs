//! リレーサーバー
//!
//! 設定された全テナントを1プロセスで提供する。`/` でNIP-11とWebSocketリレー、
//! `/status` で稼働状況を返す。
//!
//! 設定は RELAY_* 環境変数から読み、下記の引数で上書きする。
//! ログレベルは `RUST_LOG` で指定する (デフォルト: info)。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_engine::domain::LimitationConfig;
use relay_engine::gateway::{router, spawn_heartbeat, AppState};
use relay_engine::infrastructure::websocket_sender::CLOSE_GOING_AWAY;
use relay_engine::infrastructure::{
    init_logging, EngineConfig, LogFormat, NoopModeration, PluginChain, RelayInfoConfig,
    StaticReputation, StaticTenantResolver,
};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Multi-tenant in-memory Nostr relay")]
struct CliArgs {
    /// Listen address; overrides RELAY_BIND
    #[arg(long, short = 'b')]
    bind: Option<SocketAddr>,

    /// Tenants file; overrides RELAY_TENANTS_FILE
    #[arg(long, short = 't')]
    tenants_file: Option<PathBuf>,

    /// Log format (json or pretty); overrides RELAY_LOG_FORMAT
    #[arg(long)]
    log_format: Option<String>,

    /// Heartbeat interval in seconds
    #[arg(long)]
    heartbeat_secs: Option<u64>,

    /// Bearer token for /status
    #[arg(long)]
    status_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = CliArgs::parse();

    let log_format = args
        .log_format
        .as_deref()
        .map(LogFormat::parse)
        .unwrap_or_else(LogFormat::from_env);
    init_logging(log_format);

    let mut config = EngineConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(secs) = args.heartbeat_secs {
        config.heartbeat_interval = Duration::from_secs(secs);
    }
    if args.status_token.is_some() {
        config.status_token = args.status_token;
    }

    let mut tenants = StaticTenantResolver::from_env(LimitationConfig::from_env(), RelayInfoConfig::from_env())?;
    if let Some(path) = args.tenants_file.as_deref() {
        tenants = tenants.with_tenants_file(path)?;
    }

    let state = AppState::new(
        &config,
        Arc::new(tenants),
        Arc::new(StaticReputation::from_env()),
        Arc::new(NoopModeration),
        PluginChain::from_env(),
    );
    let pipeline = state.pipeline.clone();
    let connections = state.connections.clone();

    let reaper = pipeline.spawn_reaper(config.reaper_interval);
    let heartbeat = spawn_heartbeat(connections.clone(), config.heartbeat_interval);

    let app = router(state, config.status_token.clone()).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, "relay listening");

    let open_connections = connections.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            for connection in open_connections.snapshot() {
                connection.terminate(CLOSE_GOING_AWAY, "relay shutting down");
            }
        })
        .await?;

    heartbeat.abort();
    reaper.abort();
    pipeline.shutdown().await;

    info!("relay stopped");
    Ok(())
}

/// Ctrl+C または SIGTERM で完了する
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
