//! CRM Import Worker - staged bulk import of CRM records
//!
//! This worker connects to NATS and serves import requests: staging rows,
//! running or scheduling imports, reporting status and undoing imports.

mod auth;
mod cli;
mod config;
mod db;
mod defaults;
mod error;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};
use config::Config;
use services::import_service::ImportService;
use services::scheduler::ImportScheduler;
use services::strategy::StrategyRegistry;
use services::Backends;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "import-worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,crm_import_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    let config = Config::from_env()?;
    info!("Configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set to run migrations"))?;
            let pool = db::create_pool(url, config.database_max_connections).await?;
            db::run_migrations(&pool).await
        }
        Command::RunScheduled { limit } => {
            let service = build_service(&config).await?;
            let report = service.run_scheduled(limit).await?;
            info!(
                attempted = report.attempted, completed = report.completed, halted = report.halted,
                "Scheduled import run finished"
            );
            Ok(())
        }
    }
}

/// Postgres backends when a database is configured, in-memory otherwise
async fn build_backends(config: &Config) -> Result<Backends> {
    match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::create_pool(url, config.database_max_connections).await?;
            info!("Connected to PostgreSQL");
            db::run_migrations(&pool).await?;
            Ok(Backends::postgres(pool))
        }
        None => {
            warn!("DATABASE_URL not set, imports are kept in memory and lost on restart");
            Ok(Backends::in_memory())
        }
    }
}

async fn build_service(config: &Config) -> Result<Arc<ImportService>> {
    let backends = build_backends(config).await?;
    info!("Record store: {}", backends.name());
    let strategies = Arc::new(StrategyRegistry::with_builtin(&config.import.inventory_modules));
    Ok(Arc::new(ImportService::new(backends, strategies, config.import.clone())))
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting CRM Import Worker...");
    let jwt_secret = config.require_jwt_secret()?.to_string();
    let service = build_service(&config).await?;

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    let scheduler = config
        .import
        .scheduler_interval
        .map(|interval| ImportScheduler::new(Arc::clone(&service), interval).start());

    let handler_result = handlers::start_handlers(nats_client, service, jwt_secret).await;

    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    Ok(())
}
