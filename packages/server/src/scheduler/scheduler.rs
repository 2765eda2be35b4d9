//! Translates per-server intent (cron/interval + enabled) into durable
//! QueueStore schedule rows, and owns startup recovery of mid-sync servers.

use std::sync::Arc;
use std::sync::Mutex;

use sqlx::PgPool;
use tracing::{info, warn};

use crate::db::server_job_configurations::OverrideCache;
use crate::db::servers::Server;
use crate::db::{ServerJobConfiguration, SyncStatus};
use crate::error::IngestResult;
use crate::queue::{QueueStore, SendOptions};
use crate::scheduler::jobkey::{
    singleton_key_for_server, JobKey, SCHEDULER_MAINTENANCE_CRON, SCHEDULER_MAINTENANCE_QUEUE,
};
use crate::scheduler::policy::JobPolicy;

pub struct Scheduler {
    pool: PgPool,
    store: Arc<dyn QueueStore>,
    overrides: Mutex<OverrideCache>,
    skip_startup_full_sync: bool,
}

impl Scheduler {
    pub fn new(pool: PgPool, store: Arc<dyn QueueStore>, skip_startup_full_sync: bool) -> Self {
        Self {
            pool,
            store,
            overrides: Mutex::new(OverrideCache::default()),
            skip_startup_full_sync,
        }
    }

    fn build_payload(server_id: i64, job_key: JobKey) -> serde_json::Value {
        serde_json::json!({ "serverId": server_id, "jobKey": job_key.as_str() })
    }

    /// Effective cron/enabled for one `(serverId, jobKey)`: override, else
    /// the catalog default.
    fn resolve(&self, server_id: i64, job_key: JobKey) -> (String, bool) {
        let overrides = self.overrides.lock().unwrap();
        match overrides.get(server_id, job_key.as_str()) {
            Some(cfg) => (
                cfg.cron_expression.clone().unwrap_or_else(|| job_key.default_cron().to_string()),
                cfg.enabled,
            ),
            None => (job_key.default_cron().to_string(), true),
        }
    }

    /// Reconcile every cron job key for one server into schedule rows.
    /// Idempotent; failure on one key never aborts the others.
    pub async fn sync_schedules_for_server(&self, server_id: i64) -> IngestResult<()> {
        let key = singleton_key_for_server(server_id);

        for job_key in JobKey::ALL {
            let (cron, enabled) = self.resolve(server_id, job_key);
            let outcome = if enabled {
                self.store
                    .schedule(
                        job_key.queue_name(),
                        &key,
                        &cron,
                        Self::build_payload(server_id, job_key),
                        job_key.send_options(),
                    )
                    .await
            } else {
                self.store.unschedule(job_key.queue_name(), &key).await
            };

            if let Err(err) = outcome {
                warn!(server_id, job_key = job_key.as_str(), error = %err, "schedule reconcile failed");
            }
        }

        Ok(())
    }

    /// Re-read one server's overrides and re-reconcile. Called by the HTTP
    /// admin mutation that edits per-server job configuration.
    pub async fn reload_server_config(&self, server_id: i64) -> IngestResult<()> {
        let rows = ServerJobConfiguration::find_for_server(server_id, &self.pool)
            .await
            .map_err(crate::error::IngestError::QueueInternal)?;

        self.overrides.lock().unwrap().set_for_server(server_id, rows);
        self.sync_schedules_for_server(server_id).await
    }

    /// The ordered six-step startup sequence.
    pub async fn startup(&self) -> IngestResult<()> {
        // 1. Load overrides table into the two-level map.
        let rows = ServerJobConfiguration::find_all(&self.pool)
            .await
            .map_err(crate::error::IngestError::QueueInternal)?;
        *self.overrides.lock().unwrap() = OverrideCache::load(rows);

        // 2. Startup cleanup: reset stuck syncing servers.
        let reset_count = Server::reset_all_syncing(&self.pool)
            .await
            .map_err(crate::error::IngestError::QueueInternal)?;
        info!(reset_count, "reset stale syncing servers at startup");

        // 3. Backfill upstream ids if any server lacks one.
        let missing_upstream_id = Server::any_missing_upstream_id(&self.pool)
            .await
            .map_err(crate::error::IngestError::QueueInternal)?;
        if missing_upstream_id {
            self.store
                .send(
                    "backfill-jellyfin-ids",
                    serde_json::json!({}),
                    SendOptions::builder().singleton_key("backfill-jellyfin-ids").build(),
                )
                .await?;
        }

        // 4. Enqueue a startup full-sync for every server not (stale-)syncing,
        // unless the skip-startup-full-sync toggle is set.
        if !self.skip_startup_full_sync {
            let servers = Server::find_all(&self.pool)
                .await
                .map_err(crate::error::IngestError::QueueInternal)?;
            let now = chrono::Utc::now();
            let stale_after = chrono::Duration::minutes(30);
            for server in servers {
                if server.is_syncing() && !server.is_stale_syncing(now, stale_after) {
                    continue;
                }
                self.trigger_full_sync(server.id).await?;
            }
        }

        // 5. Reconcile schedules for every server.
        let servers = Server::find_all(&self.pool)
            .await
            .map_err(crate::error::IngestError::QueueInternal)?;
        for server in &servers {
            self.sync_schedules_for_server(server.id).await?;
        }

        // 6. Register the single global maintenance schedule.
        self.store
            .schedule(
                SCHEDULER_MAINTENANCE_QUEUE,
                "global",
                SCHEDULER_MAINTENANCE_CRON,
                serde_json::json!({}),
                SendOptions::builder().build(),
            )
            .await?;

        Ok(())
    }

    // -- On-demand triggers (RPCs used by the HTTP shell) --

    pub async fn trigger_full_sync(&self, server_id: i64) -> IngestResult<Option<uuid::Uuid>> {
        let key = singleton_key_for_server(server_id);
        self.store.cancel_by_singleton_key(JobKey::FullSync.queue_name(), &key).await?;
        self.store
            .send(
                JobKey::FullSync.queue_name(),
                Self::build_payload(server_id, JobKey::FullSync),
                SendOptions::from_tier(SendOptions::MANUAL_FULL_SYNC).with_singleton_key(key),
            )
            .await
    }

    pub async fn trigger_user_sync(&self, server_id: i64) -> IngestResult<Option<uuid::Uuid>> {
        self.store
            .send(
                JobKey::UserSync.queue_name(),
                Self::build_payload(server_id, JobKey::UserSync),
                SendOptions::from_tier(SendOptions::STANDARD),
            )
            .await
    }

    pub async fn trigger_library_items_sync(&self, server_id: i64) -> IngestResult<Option<uuid::Uuid>> {
        self.store
            .send(
                JobKey::RecentItemsSync.queue_name(),
                Self::build_payload(server_id, JobKey::RecentItemsSync),
                SendOptions::from_tier(SendOptions::MEDIUM),
            )
            .await
    }

    pub async fn trigger_people_sync(&self, server_id: i64) -> IngestResult<Option<uuid::Uuid>> {
        self.store
            .send(
                JobKey::PeopleSync.queue_name(),
                Self::build_payload(server_id, JobKey::PeopleSync),
                SendOptions::from_tier(SendOptions::MEDIUM),
            )
            .await
    }

    pub async fn trigger_geolocation_backfill(&self, server_id: i64) -> IngestResult<Option<uuid::Uuid>> {
        self.store
            .send(
                "backfill-activity-locations",
                serde_json::json!({ "serverId": server_id, "batchSize": 500 }),
                SendOptions::from_tier(SendOptions::LONG),
            )
            .await
    }
}

impl JobPolicy for Scheduler {
    fn is_enabled(&self, server_id: i64, job_key: &str) -> bool {
        let overrides = self.overrides.lock().unwrap();
        overrides.get(server_id, job_key).map(|cfg| cfg.enabled).unwrap_or(true)
    }

    fn effective_cron(&self, server_id: i64, job_key: &str) -> Option<String> {
        let overrides = self.overrides.lock().unwrap();
        overrides.get(server_id, job_key).and_then(|cfg| cfg.cron_expression.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_payload_carries_server_and_key() {
        let payload = Scheduler::build_payload(7, JobKey::FullSync);
        assert_eq!(payload["serverId"], 7);
        assert_eq!(payload["jobKey"], "full-sync");
    }
}
