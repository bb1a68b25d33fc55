use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use transfer_stats::services::credentials::{CredentialManager, DotenvCredentialStore};
use transfer_stats::services::remote_stats::BringYourClient;
use transfer_stats::services::scheduler::{Scheduler, SchedulerSettings, SystemClock};
use transfer_stats::services::series_store::SeriesStore;
use transfer_stats::{cli, config, db, openapi, routes, state};

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind transfer-stats listener on {addr}: port already in use. Stop the other process or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind transfer-stats listener on {addr}"))
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {err:#}");
        cancel.cancelled().await;
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(config::StatsConfig::from_env()?);
    tracing::info!(
        credentials = ?config.credentials,
        database = %config.database_path.display(),
        api_base = %config.api_base,
        interval_minutes = config.fetch_interval_minutes,
        schedule_timezone = %config.schedule_timezone,
        display_timezone = %config.display_timezone,
        "configuration loaded"
    );

    let pool = db::connect(&config.database_path).await?;
    let store = SeriesStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to prepare series store")?;
    match store.count().await {
        Ok(count) => tracing::info!(samples = count, "series store ready"),
        Err(err) => tracing::warn!("failed to count stored samples: {err:#}"),
    }

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("failed to build http client")?;
    let client = Arc::new(BringYourClient::new(http, config.api_base.clone()));
    let credentials = Arc::new(CredentialManager::load(
        config.credentials.clone(),
        config.configured_token.clone(),
        client.clone(),
        Arc::new(DotenvCredentialStore::new(config.env_file.clone())),
    ));

    let scheduler = Arc::new(Scheduler::new(
        credentials,
        client,
        store.clone(),
        Arc::new(SystemClock),
        SchedulerSettings {
            timezone: config.schedule_timezone,
            interval_minutes: config.fetch_interval_minutes,
        },
    ));

    let cancel = CancellationToken::new();
    let timer = scheduler.clone().start(cancel.clone());

    let state = state::AppState {
        config: config.clone(),
        store,
        scheduler,
    };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;
    cancel.cancel();
    if let Err(err) = timer.await {
        tracing::warn!("fetch timer task ended abnormally: {err}");
    }
    Ok(())
}
