//! rendezvous-relay binary entry point.
//!
//! Usage:
//! ```bash
//! rendezvous-relay --config relay.toml
//! ```

use anyhow::Context;
use rendezvous_relay::config::Config;
use rendezvous_relay::http::{self, health::init_start_time};
use rendezvous_relay::server::Relay;
use rendezvous_relay::store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = get_config_path();
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    init_tracing(config.server.development);
    init_start_time();

    println!("rendezvous-relay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind = %config.server.bind_address,
        development = config.server.development,
        rate_limiter = config.limits.enabled,
        cluster = config.store.cluster,
        "Starting relay"
    );

    let store = store::connect(&config.store)
        .await
        .context("connecting to the store")?;
    let bind_address = config.server.bind_address.clone();
    let grace = std::time::Duration::from_secs(config.server.shutdown_grace_secs);

    let relay = Arc::new(Relay::new(config, store));
    let tasks = relay.start().await.context("starting background tasks")?;

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!("Listening on {}", bind_address);

    let app = http::build_router(relay.clone());
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    // Open WebSocket sessions keep the server future alive; bound the wait.
    let relay_for_close = relay.clone();
    let serve = tokio::spawn(async move { server.await });
    let serve_result = tokio::select! {
        result = serve => result,
        _ = async {
            shutdown_signal().await;
            relay_for_close.adapter().close_all().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!("Shutdown grace period elapsed");
            Ok(Ok(()))
        }
    };

    tasks.abort();
    relay.shutdown().await;
    serve_result.context("server task")?.context("serving HTTP")?;
    Ok(())
}

fn init_tracing(development: bool) {
    let default = if development {
        "info,rendezvous_relay=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay.toml"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
