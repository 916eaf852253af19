use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use adsync::api::{create_sync_router, SyncAppState};
use adsync::claims::ClaimLedger;
use adsync::config::SyncConfig;
use adsync::credentials::CredentialStore;
use adsync::cron::CronWindowRegistry;
use adsync::cursor::SyncCursorStore;
use adsync::dispatch::Dispatcher;
use adsync::executor::{JobExecutor, Worker};
use adsync::janitor::Janitor;
use adsync::jobs::CrawlJobStore;
use adsync::remote::{AdsApi, HttpAdsApi, RemoteClient};
use adsync::sink::{EntitySink, MemoryEntitySink};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adsync=info".into()),
        )
        .init();

    let config = SyncConfig::from_env();
    info!(bind_addr = %config.bind_addr, "adsync starting...");

    let encryption_key = std::env::var("ADSYNC_ENCRYPTION_KEY")
        .context("ADSYNC_ENCRYPTION_KEY must be set (base64, 32 bytes)")?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir))?;
    let db_path = |name: &str| format!("{}/{name}.db", config.data_dir);

    // Stores
    let credentials = Arc::new(CredentialStore::new(db_path("credentials"), &encryption_key)?);
    let claims = Arc::new(ClaimLedger::new(
        db_path("claims"),
        config.claim_limit,
        config.claim_ttl,
    )?);
    let jobs = Arc::new(CrawlJobStore::new(db_path("jobs"))?);
    let cursors = Arc::new(SyncCursorStore::new(db_path("cursors"))?);
    let cron = Arc::new(CronWindowRegistry::new(db_path("cron"))?);

    // Remote client and sink
    let api: Arc<dyn AdsApi> = Arc::new(HttpAdsApi::new(config.ads_api_base_url.clone()));
    let client = Arc::new(RemoteClient::new(api, Arc::clone(&credentials), &config));
    let sink: Arc<dyn EntitySink> = Arc::new(MemoryEntitySink::new());

    // Workers
    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&jobs),
        Arc::clone(&cursors),
        Arc::clone(&credentials),
        client,
        sink,
    ));
    let mut handles = Vec::new();
    for i in 0..config.worker_count.max(1) {
        let worker = Worker::new(
            format!("worker-{i}"),
            Arc::clone(&jobs),
            Arc::clone(&executor),
            config.worker_poll_interval,
        );
        handles.push(worker.start());
    }

    // Janitor
    let janitor = Janitor::new(
        Arc::clone(&jobs),
        config.liveness_timeout,
        config.job_retention,
        config.janitor_interval,
    );
    handles.push(janitor.start());

    // HTTP API
    let dispatcher = Dispatcher::new(
        Arc::clone(&claims),
        Arc::clone(&jobs),
        Arc::clone(&cursors),
        Arc::clone(&cron),
        config.clone(),
    );
    let state = Arc::new(SyncAppState {
        dispatcher,
        jobs: Arc::clone(&jobs),
    });
    let router = create_sync_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(workers = config.worker_count, "adsync ready");
    axum::serve(listener, router).await?;

    for handle in handles {
        handle.abort();
    }
    Ok(())
}
