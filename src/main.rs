mod config;
mod db_types;
mod error;
mod gateway;
mod handlers;
mod reconcile;
mod records;
mod records_types;
mod signature;
mod store;
mod tasks;
mod tools;
mod types;
mod utils;
mod voice;
mod voice_types;

use crate::config::Config;
use crate::records::RecordsClient;
use crate::store::postgres::PgStore;
use crate::tasks::{run_sync_worker, RetryPolicy, SyncQueue};
use crate::types::AppState;
use crate::voice::VoiceClient;

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

pub mod consts {
    use std::time::Duration;

    pub const DEFAULT_PAGE_LIMIT: u32 = 20;
    pub const MAX_PAGE_LIMIT: u32 = 100;
    pub const RECORDS_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);
    pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
    pub const RECORDS_SIGNATURE_HEADER: &str = "x-records-signature";
    pub const VOICE_SIGNATURE_HEADER: &str = "x-voice-signature";
    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
}

fn init_tracing() {
    // RUST_LOG wins over the built-in targets when set
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok());
    let targets = env_filter.is_none().then(|| {
        tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("sqlx", LevelFilter::WARN),
            ("receptionist_rs", LevelFilter::DEBUG),
            ("dead_letter", LevelFilter::ERROR),
        ])
    });
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(env_filter)
        .with(targets)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let db_pool = match PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to connect to database");
            std::process::exit(1);
        }
    };
    if let Err(e) = sqlx::migrate!().run(&db_pool).await {
        error!(error = %e, "failed to run migrations");
        std::process::exit(1);
    }

    let http_client = match reqwest::Client::builder()
        .timeout(consts::HTTP_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build http client");
            std::process::exit(1);
        }
    };

    let (sync, sync_rx) = SyncQueue::new(config.sync_queue_capacity);
    let policy = RetryPolicy::from_config(&config);
    let bind_addr = config.bind_addr;
    let app_state = Arc::new(AppState {
        records: RecordsClient::new(http_client.clone(), &config),
        voice: VoiceClient::new(http_client, &config),
        store: Arc::new(PgStore::new(db_pool)),
        sync,
        config,
    });

    tokio::spawn(run_sync_worker(app_state.clone(), sync_rx, policy));

    let app = handlers::router(app_state);
    info!(%bind_addr, "listening");
    if let Err(e) = axum::Server::bind(&bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
