//! Mosaic compositor daemon
//!
//! Composites client surfaces onto a headless output and serves buffer
//! handles on the privileged channel until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use mosaic::Compositor;
use mosaic::config::Config;
use mosaic::headless::HeadlessBackend;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mosaic=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Mosaic compositor");

    let config = Config::load()?;
    let backend = HeadlessBackend::new(&config.compositor);
    let mut compositor =
        Compositor::configure(&config, &backend).context("Failed to configure compositor")?;

    let socket = mosaic_ipc::socket_path(&config.compositor.buffer_connector);
    compositor
        .serve(&socket)
        .with_context(|| format!("Failed to open descriptor exchange at {:?}", socket))?;

    info!("Compositing in {}", compositor.format());

    // Handle SIGTERM and SIGINT
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
        }
    }

    // Exchange server first, then the presenter; the output goes with the compositor.
    tokio::task::spawn_blocking(move || {
        compositor.shutdown();
        drop(compositor);
    })
    .await
    .context("Shutdown task failed")?;

    info!("Mosaic stopped");
    Ok(())
}
