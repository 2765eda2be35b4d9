//! `security-sync`: on-demand composite job combining a recent-activity
//! catch-up, a geolocation backfill, and a fingerprint recompute into one
//! progress-reporting run (spec §4.7's supplemental security surface).

use std::sync::Arc;

use sqlx::PgPool;
use tracing::warn;

use crate::geolocation::GeolocationPipeline;
use crate::session_poller::ActivityIngestor;
use crate::sse::SseBroadcaster;
use crate::ums_client::UmsClient;

const RECENT_ACTIVITY_PAGES: i64 = 5;
const GEOLOCATION_BATCH_SIZE: i64 = 500;
const GEOLOCATION_HARD_CAP: i64 = 10_000;

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct SecuritySyncCounters {
    pub activities_synced: i64,
    pub locations_processed: i64,
    pub fingerprints_updated: i64,
    pub anomalies_detected: i64,
}

pub struct SecuritySync {
    pool: PgPool,
    pipeline: GeolocationPipeline,
    broadcaster: Arc<SseBroadcaster>,
}

impl SecuritySync {
    pub fn new(pool: PgPool, pipeline: GeolocationPipeline, broadcaster: Arc<SseBroadcaster>) -> Self {
        Self { pool, pipeline, broadcaster }
    }

    /// Run all three phases for one server, publishing `started` /
    /// `progress` / `completed` (or `failed`) SSE events as it goes.
    pub async fn run(&self, server_id: i64, client: &Arc<dyn UmsClient>) -> anyhow::Result<SecuritySyncCounters> {
        self.broadcaster.publish("started", serde_json::json!({ "serverId": server_id }));

        let mut counters = SecuritySyncCounters::default();

        if let Err(err) = self.sync_recent_activities(server_id, client, &mut counters).await {
            self.publish_failed(server_id, &counters, &err);
            return Err(err);
        }

        if let Err(err) = self.backfill_geolocation(server_id, &mut counters).await {
            self.publish_failed(server_id, &counters, &err);
            return Err(err);
        }

        if let Err(err) = self.recompute_fingerprints(server_id, &mut counters).await {
            self.publish_failed(server_id, &counters, &err);
            return Err(err);
        }

        self.broadcaster.publish(
            "completed",
            serde_json::json!({
                "serverId": server_id,
                "activitiesSynced": counters.activities_synced,
                "locationsProcessed": counters.locations_processed,
                "fingerprintsUpdated": counters.fingerprints_updated,
                "anomaliesDetected": counters.anomalies_detected,
            }),
        );

        Ok(counters)
    }

    async fn sync_recent_activities(
        &self,
        server_id: i64,
        client: &Arc<dyn UmsClient>,
        counters: &mut SecuritySyncCounters,
    ) -> anyhow::Result<()> {
        let ingestor = ActivityIngestor::new(self.pool.clone());

        // A few extra passes over what a single poll tick would do, to
        // catch up activity ids that arrived since the last tick.
        for _ in 0..RECENT_ACTIVITY_PAGES {
            let synced = ingestor.ingest(server_id, client).await?;
            counters.activities_synced += synced as i64;
            if synced == 0 {
                break;
            }
            self.publish_progress(server_id, counters);
        }

        Ok(())
    }

    async fn backfill_geolocation(&self, server_id: i64, counters: &mut SecuritySyncCounters) -> anyhow::Result<()> {
        loop {
            let batch = self.pipeline.geolocate_activities(server_id, GEOLOCATION_BATCH_SIZE).await?;
            counters.locations_processed += batch.processed;
            counters.anomalies_detected += batch.anomalies_detected;
            self.publish_progress(server_id, counters);

            if batch.processed < GEOLOCATION_BATCH_SIZE || counters.locations_processed >= GEOLOCATION_HARD_CAP {
                if counters.locations_processed >= GEOLOCATION_HARD_CAP {
                    warn!(server_id, "security-sync geolocation backfill hit its hard cap, remaining activities deferred");
                }
                break;
            }
        }
        Ok(())
    }

    async fn recompute_fingerprints(&self, server_id: i64, counters: &mut SecuritySyncCounters) -> anyhow::Result<()> {
        let updated = self.pipeline.calculate_fingerprints(server_id).await?;
        counters.fingerprints_updated = updated as i64;
        self.publish_progress(server_id, counters);
        Ok(())
    }

    fn publish_progress(&self, server_id: i64, counters: &SecuritySyncCounters) {
        self.broadcaster.publish(
            "progress",
            serde_json::json!({
                "serverId": server_id,
                "activitiesSynced": counters.activities_synced,
                "locationsProcessed": counters.locations_processed,
                "fingerprintsUpdated": counters.fingerprints_updated,
                "anomaliesDetected": counters.anomalies_detected,
            }),
        );
    }

    fn publish_failed(&self, server_id: i64, counters: &SecuritySyncCounters, err: &anyhow::Error) {
        self.broadcaster.publish(
            "failed",
            serde_json::json!({
                "serverId": server_id,
                "error": err.to_string(),
                "activitiesSynced": counters.activities_synced,
                "locationsProcessed": counters.locations_processed,
                "fingerprintsUpdated": counters.fingerprints_updated,
                "anomaliesDetected": counters.anomalies_detected,
            }),
        );
    }
}
