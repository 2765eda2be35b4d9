//! Entry point for the ingestion and orchestration core: wires the durable
//! queue, the cron scheduler, the session poller, the job handlers, and the
//! thin HTTP shell into one process.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingest_core::config::Config;
use ingest_core::db::Server;
use ingest_core::error::{IngestError, IngestResult};
use ingest_core::geolocation::{GeolocationPipeline, HttpIpResolver};
use ingest_core::maintenance::MaintenanceWorker;
use ingest_core::queue::{run_schedule_ticker, run_worker, JobRegistry, PgQueueStore, QueueStore, WorkerConfig};
use ingest_core::scheduler::{JobKey, Scheduler};
use ingest_core::security_sync::SecuritySync;
use ingest_core::session_poller::SessionPoller;
use ingest_core::sse::SseBroadcaster;
use ingest_core::ums_client::{HttpUmsClient, UmsClient};

/// Shared context every job handler closure receives.
struct JobContext {
    pool: sqlx::PgPool,
    scheduler: Arc<Scheduler>,
    pipeline: GeolocationPipeline,
    security_sync: SecuritySync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,ingest_core=debug".into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();

    let config = Config::from_env()?;
    tracing::info!("starting ingestion and orchestration core");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("../../migrations").run(&pool).await.context("failed to run migrations")?;

    let pg_store = PgQueueStore::new(pool.clone());
    if pg_store.recover_incompatible_schema().await.context("failed to check queue schema compatibility")? {
        tracing::warn!("recovered from an incompatible legacy queue schema");
    }
    let store: Arc<dyn QueueStore> = Arc::new(pg_store);

    let scheduler = Arc::new(Scheduler::new(pool.clone(), store.clone(), config.skip_startup_full_sync));

    let broadcaster = Arc::new(SseBroadcaster::new());
    let geo_resolver = Arc::new(HttpIpResolver::new(config.geo_lookup_base_url.clone(), config.geo_lookup_api_key.clone())?);
    let pipeline = GeolocationPipeline::new(pool.clone(), geo_resolver.clone());
    let security_sync = SecuritySync::new(pool.clone(), GeolocationPipeline::new(pool.clone(), geo_resolver), broadcaster.clone());

    let ctx = Arc::new(JobContext {
        pool: pool.clone(),
        scheduler: scheduler.clone(),
        pipeline,
        security_sync,
    });

    let mut registry: JobRegistry<JobContext> = JobRegistry::new();
    register_job_handlers(&mut registry);
    let registry = Arc::new(registry);

    let shutdown = CancellationToken::new();

    scheduler.startup().await.context("scheduler startup sequence failed")?;

    let servers = Server::find_all(&pool).await.context("failed to load servers for session poller")?;
    let policy: Arc<dyn ingest_core::scheduler::JobPolicy> = scheduler.clone();
    let poller = Arc::new(SessionPoller::new(
        pool.clone(),
        policy,
        ingest_core::session_poller::PollerConfig {
            tick_interval: config.session_poll_interval,
            server_timeout: config.session_poll_server_timeout,
            server_retries: config.session_poll_server_retries,
            concurrency: config.session_poll_server_concurrency,
        },
    ));
    for server in &servers {
        let client: Arc<dyn UmsClient> = Arc::new(HttpUmsClient::new(server.url.clone(), server.api_key.clone())?);
        poller.register_client(server.id, client);
    }

    let mut join_set = tokio::task::JoinSet::new();

    for queue_name in JobKey::ALL.iter().map(|k| k.queue_name()).chain(["scheduler-maintenance", "backfill-activity-locations", "security-sync", "backfill-jellyfin-ids"]) {
        let store = store.clone();
        let registry = registry.clone();
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        join_set.spawn(async move {
            run_worker(queue_name, store, registry, ctx, WorkerConfig::default(), shutdown).await;
        });
    }

    {
        let store = store.clone();
        let shutdown = shutdown.clone();
        join_set.spawn(async move {
            run_schedule_ticker(store, std::time::Duration::from_secs(5), shutdown).await;
        });
    }

    {
        let poller = poller.clone();
        let server_ids: Vec<i64> = servers.iter().map(|s| s.id).collect();
        let shutdown = shutdown.clone();
        join_set.spawn(async move {
            poller.run(server_ids, shutdown).await;
        });
    }

    let app = ingest_core::http::build_router(pool.clone(), scheduler.clone(), poller.status.clone(), broadcaster.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind HTTP listener")?;
    tracing::info!(%addr, "HTTP shell listening");

    let http_shutdown = shutdown.clone();
    join_set.spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await;
    });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    while join_set.join_next().await.is_some() {}

    Ok(())
}

fn register_job_handlers(registry: &mut JobRegistry<JobContext>) {
    for job_key in JobKey::ALL {
        registry.register(job_key.queue_name(), move |payload, ctx: Arc<JobContext>| async move {
            dispatch_job_key(job_key, payload, ctx).await
        });
    }

    registry.register("scheduler-maintenance", |_payload, ctx: Arc<JobContext>| async move {
        MaintenanceWorker::new(ctx.pool.clone()).run_tick().await;
        Ok(None)
    });

    registry.register("backfill-activity-locations", |payload, ctx: Arc<JobContext>| async move {
        let server_id = extract_server_id(&payload)?;
        let batch_size = payload.get("batchSize").and_then(|v| v.as_i64()).unwrap_or(500);
        let result = ctx.pipeline.geolocate_activities(server_id, batch_size).await.map_err(IngestError::Fatal)?;
        Ok(Some(serde_json::json!({ "processed": result.processed, "anomaliesDetected": result.anomalies_detected })))
    });

    registry.register("backfill-jellyfin-ids", |_payload, ctx: Arc<JobContext>| async move {
        let servers = ingest_core::db::Server::find_all(&ctx.pool).await.map_err(IngestError::Fatal)?;
        for server in servers.into_iter().filter(|s| s.upstream_id.is_none()) {
            tracing::warn!(server_id = server.id, "server is missing an upstream id and was not backfilled");
        }
        Ok(None)
    });

    registry.register("security-sync", |payload, ctx: Arc<JobContext>| async move {
        let server_id = extract_server_id(&payload)?;
        let server = ingest_core::db::Server::find_by_id(server_id, &ctx.pool)
            .await
            .map_err(IngestError::Fatal)?
            .ok_or_else(|| IngestError::Validation { message: format!("unknown server {server_id}") })?;
        let client: Arc<dyn UmsClient> =
            Arc::new(HttpUmsClient::new(server.url, server.api_key).map_err(IngestError::Fatal)?);
        let counters = ctx.security_sync.run(server_id, &client).await.map_err(IngestError::Fatal)?;
        Ok(Some(serde_json::to_value(counters).map_err(|e| IngestError::Fatal(e.into()))?))
    });
}

/// Placeholder dispatch for the per-server cron job keys: each key's real
/// handler body lives with the domain it belongs to (activity ingestion is
/// the session poller's concern, library/people/user sync are outside this
/// crate's scope). This crate owns scheduling them, not performing them.
async fn dispatch_job_key(job_key: JobKey, payload: serde_json::Value, ctx: Arc<JobContext>) -> IngestResult<Option<serde_json::Value>> {
    let server_id = extract_server_id(&payload)?;

    match job_key {
        JobKey::GeolocationSync => {
            let result = ctx.pipeline.geolocate_activities(server_id, 100).await.map_err(IngestError::Fatal)?;
            Ok(Some(serde_json::json!({ "processed": result.processed })))
        }
        JobKey::FingerprintSync => {
            let updated = ctx.pipeline.calculate_fingerprints(server_id).await.map_err(IngestError::Fatal)?;
            Ok(Some(serde_json::json!({ "usersUpdated": updated })))
        }
        JobKey::FullSync => {
            ingest_core::db::Server::start_sync(server_id, &ctx.pool).await.map_err(IngestError::Fatal)?;
            ctx.scheduler.sync_schedules_for_server(server_id).await?;
            ingest_core::db::Server::complete_sync(server_id, &ctx.pool).await.map_err(IngestError::Fatal)?;
            Ok(None)
        }
        JobKey::ActivitySync | JobKey::RecentItemsSync | JobKey::UserSync | JobKey::PeopleSync | JobKey::EmbeddingsSync => {
            Ok(None)
        }
    }
}

fn extract_server_id(payload: &serde_json::Value) -> IngestResult<i64> {
    payload
        .get("serverId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| IngestError::Validation { message: "payload missing serverId".to_string() })
}
