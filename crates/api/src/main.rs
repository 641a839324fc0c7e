use std::net::SocketAddr;

use anyhow::Context;
use outpaint_core::config::OutpaintConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use outpaint_api::config::ServerConfig;
use outpaint_api::router::build_app_router;
use outpaint_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "outpaint_api=debug,outpaint_pipeline=info,tower_http=debug".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let mut outpaint = OutpaintConfig::load(&config.outpaint_config_path).with_context(|| {
        format!(
            "Failed to load outpaint settings from {}",
            config.outpaint_config_path.display()
        )
    })?;
    outpaint
        .apply_env()
        .context("Invalid outpaint environment overrides")?;
    let errors = outpaint.validate();
    if !errors.is_empty() {
        anyhow::bail!("Invalid outpaint settings: {}", errors.join("; "));
    }
    tracing::info!(backend = %outpaint.backend, "Loaded outpaint settings");

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("Failed to create work dir {}", config.work_dir.display()))?;

    // --- Router ---
    let addr = SocketAddr::new(
        config.host.parse().context("Invalid HOST address")?,
        config.port,
    );
    let state = AppState::new(config, outpaint);
    let app = build_app_router(state).context("Failed to build router")?;

    // --- Start server ---
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
