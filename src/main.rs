//! Gatehouse HTTP server
//!
//! Starts an Axum web server that forwards LLM requests to local and cloud
//! backends.

use clap::Parser;
use gatehouse::{
    cli::{Cli, Command, generate_config_template},
    config::Config,
    handlers::{self, AppState},
    shedder::SystemProbe,
    telemetry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Command::Config { output }) = cli.command {
        let template = generate_config_template();
        match output {
            Some(path) => {
                std::fs::write(&path, template)?;
                println!("Wrote configuration template to {}", path);
            }
            None => print!("{}", template),
        }
        return Ok(());
    }

    let config = Arc::new(Config::from_file(&cli.config)?);
    telemetry::init(&config.observability.log_level);

    tracing::info!(
        "Starting Gatehouse on {}:{} with {} backends",
        config.server.host,
        config.server.port,
        config.backends.len()
    );

    let probe = Arc::new(SystemProbe::new(config.load_shedding.memory_limit_mb));
    let sampler = probe.clone().spawn_sampler(Duration::from_millis(
        config.load_shedding.sample_interval_ms,
    ));

    let state = AppState::new(config.clone(), probe)?;
    let app = handlers::router(state);

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0])),
        config.server.port,
    ));

    tracing::info!("Listening on {}", addr);
    tracing::info!("Health check available at http://{}/health/ready", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sampler.abort();
    tracing::info!("Gatehouse stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
