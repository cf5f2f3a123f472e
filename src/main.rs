//! # Subtitle Transcriber - Main Application Entry Point
//!
//! HTTP service that turns uploaded audio into styled subtitle JSON.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: requests, the idle monitor and model loading all share one runtime
//! - **Arc**: the model manager is built once here and shared by every worker
//! - **static**: the shutdown flag lives for the entire program duration
//!
//! ## Application Architecture:
//! - **config**: layered configuration (file + environment variables)
//! - **device**: compute device detection and failure classification
//! - **audio**: upload decoding, resampling and speech detection
//! - **transcription**: model lifecycle manager, Whisper loader and executor
//! - **subtitle**: language detection, cue segmentation and response styling
//! - **state**: shared application state and metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: bearer auth and request metrics
//! - **handlers**: HTTP request handlers
//! - **error**: HTTP error type and error responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod subtitle;
mod transcription;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use device::DeviceProber;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{ModelManager, WhisperLoader};

/// Set by the signal handlers once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Builds the model manager** (nothing is loaded until the first request)
/// 3. **Starts the idle monitor** that unloads the model when unused
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**: in-flight requests finish, then the model is released
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!("Starting subtitle-transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.model.name,
        device = ?config.model.device,
        idle_timeout_secs = config.server.idle_timeout,
        check_interval_secs = config.server.check_interval,
        auth_enabled = config.auth_enabled(),
        "Configuration loaded"
    );

    let loader = WhisperLoader::new(
        &config.model.name,
        &config.model.vad_model,
        &config.model.punc_model,
        config.model.language.clone(),
        config.model.disable_update,
        config.model.cache_dir.clone(),
    )?;
    let prober = DeviceProber::new(config.model.device, config.model.min_free_memory_mb);
    let models = ModelManager::new(Arc::new(loader), Arc::new(prober), config.lifecycle_settings());
    let monitor = models.spawn_idle_monitor();

    let app_state = AppState::new(config.clone(), Arc::clone(&models));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let config = Arc::clone(&app_state.config);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::RequestMetrics)
            .wrap(TracingLogger::default())
            .wrap(cors)
            .configure(|cfg| handlers::routes(cfg, &config))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    monitor.stop();
    models.shutdown();

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "info", "subtitle_transcriber=trace")
/// - If not set, defaults to "subtitle_transcriber=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subtitle_transcriber=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag on the first one.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
