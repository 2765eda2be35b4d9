//! Per-queue worker loop.
//!
//! One logical worker per registered queue: fetch up to `batch_size` jobs,
//! mark them active, dispatch to the registry, write terminal state.
//! Handlers run serially within a worker; different queues run concurrently
//! (spawned as separate tasks by [`crate::queue::manager::QueueManager`]).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::registry::JobRegistry;
use super::store::QueueStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Runs the claim -> dispatch -> finalize loop for a single queue name
/// until `shutdown` is cancelled.
pub async fn run_worker<Ctx: Send + Sync + 'static>(
    queue_name: &'static str,
    store: Arc<dyn QueueStore>,
    registry: Arc<JobRegistry<Ctx>>,
    ctx: Arc<Ctx>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    tracing::info!(queue = queue_name, "worker starting");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let jobs = match store.claim(queue_name, config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(queue = queue_name, error = %e, "failed to claim jobs");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
                continue;
            }
        };

        if jobs.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
            continue;
        }

        debug!(queue = queue_name, count = jobs.len(), "claimed jobs");

        for job in jobs {
            let start = std::time::Instant::now();
            match registry.execute(queue_name, job.payload.clone(), ctx.clone()).await {
                Ok(output) => {
                    if let Err(e) = store.complete(job.id, output).await {
                        error!(job_id = %job.id, error = %e, "failed to mark job completed");
                    }
                    debug!(job_id = %job.id, queue = queue_name, elapsed_ms = start.elapsed().as_millis() as u64, "job succeeded");
                }
                Err(e) => {
                    warn!(job_id = %job.id, queue = queue_name, error = %e, "job failed");
                    if let Err(e) = store.fail(job.id, &e.to_string()).await {
                        error!(job_id = %job.id, error = %e, "failed to mark job failed");
                    }
                }
            }
        }
    }

    tracing::info!(queue = queue_name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::SendOptions;
    use crate::queue::store::InMemoryQueueStore;

    struct Ctx;

    #[tokio::test]
    async fn worker_processes_one_job_then_stops() {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        store
            .send("test-queue", serde_json::json!({"n": 1}), SendOptions::builder().build())
            .await
            .unwrap();

        let mut registry: JobRegistry<Ctx> = JobRegistry::new();
        registry.register("test-queue", |payload, _ctx| async move { Ok(Some(payload)) });
        let registry = Arc::new(registry);

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let store_clone = store.clone();

        let handle = tokio::spawn(async move {
            run_worker(
                "test-queue",
                store_clone,
                registry,
                Arc::new(Ctx),
                WorkerConfig {
                    batch_size: 10,
                    poll_interval: Duration::from_millis(20),
                },
                shutdown_clone,
            )
            .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let stats = store.get_queue_stats("test-queue").await.unwrap();
        assert_eq!(stats.completed_count, 1);
    }
}
