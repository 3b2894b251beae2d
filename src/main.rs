/*
 * Diarization Server - Rust Edition
 * Copyright (c) 2024 Diarization Server Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;

use diarization_server_rs::config::Config;
use diarization_server_rs::server::{self, AppState};
use diarization_server_rs::{audio, cache, scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;

    let config = Arc::new(Config::load().await?);
    tracing::info!(
        "starting diarization server on {}:{} (model: {:?})",
        config.host,
        config.port,
        config.segmentation_model
    );

    let scheduler = scheduler::global(config.scheduler_config());
    let cache = cache::global(config.cache_config());
    spawn_event_logger(&scheduler);
    audio::spawn_temp_janitor(config.temp_dir.clone());

    let state = AppState {
        config: config.clone(),
        scheduler,
        cache,
        started_at: Instant::now(),
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server stopped");
    Ok(())
}

/// Forward scheduler lifecycle events into the log. Purely advisory; the
/// scheduler does not care whether anyone listens.
fn spawn_event_logger(scheduler: &scheduler::JobScheduler) {
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!("queue: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("event logger lagged, skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

fn setup_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Create log directory
    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".diarization-server")
        .join("logs");

    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Create rolling file appender (daily rotation)
    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &log_dir, "diarization-server.log");

    // Layered logging: everything to file, compact info+ to stderr.
    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("diarization_server_rs=debug".parse()?)
                        .add_directive("debug".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("diarization_server_rs=info".parse()?)
                        .add_directive("info".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    tracing::debug!("logging initialized, files under {:?}", log_dir);
    Ok(())
}
