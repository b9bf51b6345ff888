//! doorman is an authenticating reverse proxy for a single backend origin.
//!
//! It answers on up to two listeners (plaintext and TLS), requires every
//! request to carry a session cookie proving a completed OAuth login, and
//! forwards authenticated requests to the configured backend. Everything
//! else is redirected into the provider login flow.

use std::env::var;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tower_cookies::CookieManagerLayer;
use tower_http::{
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
    LatencyUnit,
};
use tracing::{info, Level};

use doorman::{config::Config, routes, shutdown, ServerState};

/// How long draining connections get after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "doorman", about = "An authenticating reverse proxy")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "doorman.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let config = Config::load(&args.config)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    let state = ServerState::new(config.clone())?;

    let app = routes(&config).with_state(state).layer(
        ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .on_request(DefaultOnRequest::new().level(Level::INFO))
                    .on_response(
                        DefaultOnResponse::new()
                            .level(Level::INFO)
                            .latency_unit(LatencyUnit::Micros),
                    ),
            )
            .layer(CookieManagerLayer::new()),
    );

    let controller = shutdown::Controller::new();
    let mut servers = JoinSet::new();

    if let Some(addr) = config.server.listen_addr {
        let app = app.clone();
        let mut watcher = controller.subscribe();

        servers.spawn(async move {
            // holding a watcher keeps shutdown() waiting for this task
            let _guard = watcher.clone();

            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!("listening on http://{addr}");

            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { watcher.notified().await })
            .await
            .context("http listener stopped")
        });
    }

    if let (Some(addr), Some(cert), Some(key)) = (
        config.server.listen_addr_tls,
        config.server.tls_cert.clone(),
        config.server.tls_key.clone(),
    ) {
        let tls = RustlsConfig::from_pem_file(&cert, &key)
            .await
            .context("failed to load TLS certificate or key")?;

        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            let mut watcher = controller.subscribe();
            tokio::spawn(async move {
                watcher.notified().await;
                handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
            });
        }

        let app = app.clone();
        let watcher = controller.subscribe();

        servers.spawn(async move {
            // holding the watcher keeps shutdown() waiting for this task
            let _watcher = watcher;
            info!("listening on https://{addr}");

            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .context("https listener stopped")
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining connections");
            controller.shutdown().await;
        }
        Some(result) = servers.join_next() => {
            result.context("listener task panicked")??;
        }
    }

    Ok(())
}
