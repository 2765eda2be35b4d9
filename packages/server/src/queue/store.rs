//! QueueStore: the durable, Postgres-backed job queue.
//!
//! Mirrors the teacher's `kernel/jobs/job.rs` claiming pattern (`FOR UPDATE
//! SKIP LOCKED`, lease-free here since jobs run to completion inside one
//! worker tick) generalized to the send/schedule/work/fetch/cancel contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::queue::job::{Job, JobState, SendOptions};
use crate::queue::schedule::{DueSchedule, Schedule, StoredSendOptions};

#[derive(Debug, Clone, Default)]
pub struct QueueDefaults {
    pub retry_limit: i32,
    pub retry_delay: i64,
    pub retention_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueStats {
    pub queue_name: String,
    pub created_count: i64,
    pub retry_count: i64,
    pub active_count: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub cancelled_count: i64,
    pub expired_count: i64,
}

impl QueueStats {
    pub fn queued_count(&self) -> i64 {
        self.created_count + self.retry_count
    }
}

/// The QueueStore contract from spec §4.1. All operations are transactional
/// against the backing store.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn create_queue(&self, name: &str, defaults: QueueDefaults) -> IngestResult<()>;

    /// Returns `None` iff `opts.singleton_key` collides with an in-flight job.
    async fn send(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> IngestResult<Option<Uuid>>;

    async fn schedule(
        &self,
        name: &str,
        schedule_key: &str,
        cron_expr: &str,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> IngestResult<()>;

    async fn unschedule(&self, name: &str, schedule_key: &str) -> IngestResult<()>;

    /// Schedules with an occurrence due as of `now`, one entry per schedule
    /// with its next unfired occurrence, not one per tick.
    async fn due_schedules(&self, now: DateTime<Utc>) -> IngestResult<Vec<DueSchedule>>;

    /// Record that `occurrence` was enqueued for `(name, schedule_key)`, so
    /// `due_schedules` won't report it again.
    async fn mark_schedule_ran(
        &self,
        name: &str,
        schedule_key: &str,
        occurrence: DateTime<Utc>,
    ) -> IngestResult<()>;

    /// Atomically claims up to `batch_size` ready jobs for `name`, marking
    /// them active. Used by the worker loop (`work`).
    async fn claim(&self, name: &str, batch_size: i64) -> IngestResult<Vec<Job>>;

    /// Ad-hoc inspection/cancellation fetch, does not change state.
    async fn fetch(&self, name: &str, batch_size: i64) -> IngestResult<Vec<Job>>;

    async fn complete(&self, job_id: Uuid, output: Option<serde_json::Value>) -> IngestResult<()>;

    /// Mark failed; transitions to `retry` (with backoff) if retries remain,
    /// else `failed`.
    async fn fail(&self, job_id: Uuid, error: &str) -> IngestResult<()>;

    async fn cancel(&self, name: &str, ids: &[Uuid]) -> IngestResult<u64>;

    /// Cancel every in-flight job on `name` for the given singleton key
    /// (used to preempt a queued full-sync before enqueueing a manual one).
    async fn cancel_by_singleton_key(&self, name: &str, singleton_key: &str) -> IngestResult<u64>;

    async fn get_job_by_id(&self, name: &str, id: Uuid) -> IngestResult<Option<Job>>;

    async fn get_queue_stats(&self, name: &str) -> IngestResult<QueueStats>;

    /// Expire active jobs whose `expire_in_seconds` has elapsed, and delete
    /// terminal jobs past their `retention_seconds`.
    async fn reap(&self) -> IngestResult<()>;
}

/// Postgres-backed implementation.
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Detect and recover from an incompatible legacy schema: a `job` table
    /// (singular, no trailing `s`) without a `queue` table is the signal
    /// the original pg-boss-style schema was never created. The queue is
    /// operational state, not durable user data, so we drop and recreate it.
    pub async fn recover_incompatible_schema(&self) -> IngestResult<bool> {
        let legacy_job_table: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'job')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| IngestError::Fatal(e.into()))?;

        let queue_table: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'queue')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| IngestError::Fatal(e.into()))?;

        if legacy_job_table && !queue_table {
            tracing::warn!("incompatible queue schema detected, dropping and recreating");
            sqlx::query("DROP TABLE IF EXISTS job CASCADE")
                .execute(&self.pool)
                .await
                .map_err(|e| IngestError::Fatal(e.into()))?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn create_queue(&self, name: &str, defaults: QueueDefaults) -> IngestResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queues (name, retry_limit, retry_delay, retention_seconds)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                retry_limit = EXCLUDED.retry_limit,
                retry_delay = EXCLUDED.retry_delay,
                retention_seconds = EXCLUDED.retention_seconds
            "#,
        )
        .bind(name)
        .bind(defaults.retry_limit)
        .bind(defaults.retry_delay)
        .bind(defaults.retention_seconds)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(())
    }

    async fn send(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> IngestResult<Option<Uuid>> {
        let job = Job::new(name, payload, &opts);

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue_name, payload, state, created_on, start_after,
                retry_limit, retry_delay, retention_seconds, expire_in_seconds, singleton_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (queue_name, singleton_key) WHERE singleton_key IS NOT NULL AND state IN ('created', 'retry', 'active')
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.queue_name)
        .bind(&job.payload)
        .bind(job.state)
        .bind(job.created_on)
        .bind(job.start_after)
        .bind(job.retry_limit)
        .bind(job.retry_delay)
        .bind(job.retention_seconds)
        .bind(job.expire_in_seconds)
        .bind(&job.singleton_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(row.map(|r| r.get::<Uuid, _>("id")))
    }

    async fn schedule(
        &self,
        name: &str,
        schedule_key: &str,
        cron_expr: &str,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> IngestResult<()> {
        let stored_opts = serde_json::to_value(StoredSendOptions::from(&opts))
            .map_err(|e| IngestError::QueueInternal(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO schedules (queue_name, schedule_key, cron_expression, payload, send_options, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            ON CONFLICT (queue_name, schedule_key) DO UPDATE SET
                cron_expression = EXCLUDED.cron_expression,
                payload = EXCLUDED.payload,
                send_options = EXCLUDED.send_options,
                updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(schedule_key)
        .bind(cron_expr)
        .bind(&payload)
        .bind(&stored_opts)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(())
    }

    async fn unschedule(&self, name: &str, schedule_key: &str) -> IngestResult<()> {
        sqlx::query("DELETE FROM schedules WHERE queue_name = $1 AND schedule_key = $2")
            .bind(name)
            .bind(schedule_key)
            .execute(&self.pool)
            .await
            .map_err(|e| IngestError::QueueInternal(e.into()))?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> IngestResult<Vec<DueSchedule>> {
        let schedules: Vec<Schedule> = sqlx::query_as(
            r#"
            SELECT queue_name, schedule_key, cron_expression, payload, send_options, created_at, updated_at, last_run_at
            FROM schedules
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(schedules
            .into_iter()
            .filter_map(|s| {
                let occurrence = s.due_occurrence(now).ok().flatten()?;
                Some(DueSchedule { schedule: s, occurrence })
            })
            .collect())
    }

    async fn mark_schedule_ran(
        &self,
        name: &str,
        schedule_key: &str,
        occurrence: DateTime<Utc>,
    ) -> IngestResult<()> {
        sqlx::query(
            r#"
            UPDATE schedules SET last_run_at = $3
            WHERE queue_name = $1 AND schedule_key = $2
            "#,
        )
        .bind(name)
        .bind(schedule_key)
        .bind(occurrence)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(())
    }

    async fn claim(&self, name: &str, batch_size: i64) -> IngestResult<Vec<Job>> {
        let jobs: Vec<Job> = sqlx::query_as(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE queue_name = $1
                  AND state IN ('created', 'retry')
                  AND start_after <= NOW()
                ORDER BY start_after
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'active', started_on = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING id, queue_name, payload, state, created_on, started_on, start_after,
                      completed_on, output, retry_limit, retry_count, retry_delay,
                      retention_seconds, expire_in_seconds, singleton_key
            "#,
        )
        .bind(name)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IngestError::DbStall(e.into()))?;

        Ok(jobs)
    }

    async fn fetch(&self, name: &str, batch_size: i64) -> IngestResult<Vec<Job>> {
        let jobs: Vec<Job> = sqlx::query_as(
            r#"
            SELECT id, queue_name, payload, state, created_on, started_on, start_after,
                   completed_on, output, retry_limit, retry_count, retry_delay,
                   retention_seconds, expire_in_seconds, singleton_key
            FROM jobs
            WHERE queue_name = $1
            ORDER BY created_on DESC
            LIMIT $2
            "#,
        )
        .bind(name)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(jobs)
    }

    async fn complete(&self, job_id: Uuid, output: Option<serde_json::Value>) -> IngestResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET state = 'completed', completed_on = NOW(), output = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(output)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::FinalizeFailure {
            job_id,
            source: e.into(),
        })?;

        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> IngestResult<()> {
        let job: Option<Job> = sqlx::query_as(
            r#"
            SELECT id, queue_name, payload, state, created_on, started_on, start_after,
                   completed_on, output, retry_limit, retry_count, retry_delay,
                   retention_seconds, expire_in_seconds, singleton_key
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        let Some(job) = job else {
            return Ok(());
        };

        let output = serde_json::json!({ "error": error });

        if job.retry_count < job.retry_limit {
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'retry', retry_count = retry_count + 1,
                    start_after = NOW() + ($2 || ' seconds')::INTERVAL, output = $3
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(job.retry_delay.to_string())
            .bind(output)
            .execute(&self.pool)
            .await
            .map_err(|e| IngestError::QueueInternal(e.into()))?;
        } else {
            sqlx::query(
                r#"
                UPDATE jobs SET state = 'failed', completed_on = NOW(), output = $2
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(output)
            .execute(&self.pool)
            .await
            .map_err(|e| IngestError::QueueInternal(e.into()))?;
        }

        Ok(())
    }

    async fn cancel(&self, name: &str, ids: &[Uuid]) -> IngestResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'cancelled', completed_on = NOW()
            WHERE queue_name = $1 AND id = ANY($2) AND state IN ('created', 'retry', 'active')
            "#,
        )
        .bind(name)
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(result.rows_affected())
    }

    async fn cancel_by_singleton_key(&self, name: &str, singleton_key: &str) -> IngestResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'cancelled', completed_on = NOW()
            WHERE queue_name = $1 AND singleton_key = $2 AND state IN ('created', 'retry', 'active')
            "#,
        )
        .bind(name)
        .bind(singleton_key)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(result.rows_affected())
    }

    async fn get_job_by_id(&self, name: &str, id: Uuid) -> IngestResult<Option<Job>> {
        let job: Option<Job> = sqlx::query_as(
            r#"
            SELECT id, queue_name, payload, state, created_on, started_on, start_after,
                   completed_on, output, retry_limit, retry_count, retry_delay,
                   retention_seconds, expire_in_seconds, singleton_key
            FROM jobs WHERE queue_name = $1 AND id = $2
            "#,
        )
        .bind(name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(job)
    }

    async fn get_queue_stats(&self, name: &str) -> IngestResult<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'created') AS created_count,
                COUNT(*) FILTER (WHERE state = 'retry') AS retry_count,
                COUNT(*) FILTER (WHERE state = 'active') AS active_count,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed_count,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed_count,
                COUNT(*) FILTER (WHERE state = 'cancelled') AS cancelled_count,
                COUNT(*) FILTER (WHERE state = 'expired') AS expired_count
            FROM jobs WHERE queue_name = $1
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(QueueStats {
            queue_name: name.to_string(),
            created_count: row.get("created_count"),
            retry_count: row.get("retry_count"),
            active_count: row.get("active_count"),
            completed_count: row.get("completed_count"),
            failed_count: row.get("failed_count"),
            cancelled_count: row.get("cancelled_count"),
            expired_count: row.get("expired_count"),
        })
    }

    async fn reap(&self) -> IngestResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET state = 'expired', completed_on = NOW()
            WHERE state = 'active'
              AND started_on IS NOT NULL
              AND started_on + (expire_in_seconds || ' seconds')::INTERVAL < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state IN ('completed', 'cancelled', 'failed', 'expired')
              AND completed_on IS NOT NULL
              AND completed_on + (retention_seconds || ' seconds')::INTERVAL < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::QueueInternal(e.into()))?;

        Ok(())
    }
}

/// In-memory `QueueStore`, mirroring the teacher's `TestJobManager`/
/// `MockJobHandler` pattern, used by this crate's own tests to assert on
/// enqueued jobs without a database.
#[derive(Default)]
pub struct InMemoryQueueStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    schedules: Mutex<HashMap<(String, String), Schedule>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs_for(&self, name: &str) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.queue_name == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn create_queue(&self, _name: &str, _defaults: QueueDefaults) -> IngestResult<()> {
        Ok(())
    }

    async fn send(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> IngestResult<Option<Uuid>> {
        let mut jobs = self.jobs.lock().unwrap();

        if let Some(ref key) = opts.singleton_key {
            let collides = jobs
                .values()
                .any(|j| j.queue_name == name && j.singleton_key.as_deref() == Some(key) && j.state.is_in_flight());
            if collides {
                return Ok(None);
            }
        }

        let job = Job::new(name, payload, &opts);
        let id = job.id;
        jobs.insert(id, job);
        Ok(Some(id))
    }

    async fn schedule(
        &self,
        name: &str,
        schedule_key: &str,
        cron_expr: &str,
        payload: serde_json::Value,
        opts: SendOptions,
    ) -> IngestResult<()> {
        let stored = serde_json::to_value(StoredSendOptions::from(&opts))
            .map_err(|e| IngestError::QueueInternal(e.into()))?;
        let now = Utc::now();
        let mut schedules = self.schedules.lock().unwrap();
        let last_run_at = schedules
            .get(&(name.to_string(), schedule_key.to_string()))
            .and_then(|s| s.last_run_at);
        schedules.insert(
            (name.to_string(), schedule_key.to_string()),
            Schedule {
                queue_name: name.to_string(),
                schedule_key: schedule_key.to_string(),
                cron_expression: cron_expr.to_string(),
                payload,
                send_options: stored,
                created_at: now,
                updated_at: now,
                last_run_at,
            },
        );
        Ok(())
    }

    async fn unschedule(&self, name: &str, schedule_key: &str) -> IngestResult<()> {
        self.schedules
            .lock()
            .unwrap()
            .remove(&(name.to_string(), schedule_key.to_string()));
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> IngestResult<Vec<DueSchedule>> {
        Ok(self
            .schedules
            .lock()
            .unwrap()
            .values()
            .filter_map(|s| {
                let occurrence = s.due_occurrence(now).ok().flatten()?;
                Some(DueSchedule { schedule: s.clone(), occurrence })
            })
            .collect())
    }

    async fn mark_schedule_ran(
        &self,
        name: &str,
        schedule_key: &str,
        occurrence: DateTime<Utc>,
    ) -> IngestResult<()> {
        if let Some(schedule) = self
            .schedules
            .lock()
            .unwrap()
            .get_mut(&(name.to_string(), schedule_key.to_string()))
        {
            schedule.last_run_at = Some(occurrence);
        }
        Ok(())
    }

    async fn claim(&self, name: &str, batch_size: i64) -> IngestResult<Vec<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for job in jobs.values_mut() {
            if claimed.len() as i64 >= batch_size {
                break;
            }
            if job.queue_name == name && job.is_ready(now) {
                job.state = JobState::Active;
                job.started_on = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn fetch(&self, name: &str, batch_size: i64) -> IngestResult<Vec<Job>> {
        Ok(self
            .jobs_for(name)
            .into_iter()
            .take(batch_size as usize)
            .collect())
    }

    async fn complete(&self, job_id: Uuid, output: Option<serde_json::Value>) -> IngestResult<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            job.state = JobState::Completed;
            job.completed_on = Some(Utc::now());
            job.output = output;
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> IngestResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.output = Some(serde_json::json!({ "error": error }));
            if job.retry_count < job.retry_limit {
                job.state = JobState::Retry;
                job.retry_count += 1;
                job.start_after = Utc::now() + chrono::Duration::seconds(job.retry_delay);
            } else {
                job.state = JobState::Failed;
                job.completed_on = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn cancel(&self, name: &str, ids: &[Uuid]) -> IngestResult<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut count = 0;
        for id in ids {
            if let Some(job) = jobs.get_mut(id) {
                if job.queue_name == name && job.state.is_in_flight() {
                    job.state = JobState::Cancelled;
                    job.completed_on = Some(Utc::now());
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn cancel_by_singleton_key(&self, name: &str, singleton_key: &str) -> IngestResult<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.queue_name == name
                && job.singleton_key.as_deref() == Some(singleton_key)
                && job.state.is_in_flight()
            {
                job.state = JobState::Cancelled;
                job.completed_on = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_job_by_id(&self, name: &str, id: Uuid) -> IngestResult<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&id)
            .filter(|j| j.queue_name == name)
            .cloned())
    }

    async fn get_queue_stats(&self, name: &str) -> IngestResult<QueueStats> {
        let mut stats = QueueStats {
            queue_name: name.to_string(),
            ..Default::default()
        };
        for job in self.jobs_for(name) {
            match job.state {
                JobState::Created => stats.created_count += 1,
                JobState::Retry => stats.retry_count += 1,
                JobState::Active => stats.active_count += 1,
                JobState::Completed => stats.completed_count += 1,
                JobState::Failed => stats.failed_count += 1,
                JobState::Cancelled => stats.cancelled_count += 1,
                JobState::Expired => stats.expired_count += 1,
            }
        }
        Ok(stats)
    }

    async fn reap(&self) -> IngestResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn singleton_key_collision_returns_none() {
        let store = InMemoryQueueStore::new();
        let opts = SendOptions::builder().singleton_key("geolocate-activities-1").build();
        let first = store
            .send("geolocate-activities", serde_json::json!({}), opts.clone())
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .send("geolocate-activities", serde_json::json!({}), opts)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claim_marks_jobs_active() {
        let store = InMemoryQueueStore::new();
        store
            .send("q", serde_json::json!({}), SendOptions::builder().build())
            .await
            .unwrap();

        let claimed = store.claim("q", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].state, JobState::Active);
    }

    #[tokio::test]
    async fn fail_with_exhausted_retries_goes_to_failed() {
        let store = InMemoryQueueStore::new();
        let opts = SendOptions::builder().retry_limit(0).build();
        let id = store
            .send("q", serde_json::json!({}), opts)
            .await
            .unwrap()
            .unwrap();

        store.fail(id, "boom").await.unwrap();
        let job = store.get_job_by_id("q", id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn fail_with_retries_remaining_goes_to_retry() {
        let store = InMemoryQueueStore::new();
        let opts = SendOptions::builder().retry_limit(2).build();
        let id = store
            .send("q", serde_json::json!({}), opts)
            .await
            .unwrap()
            .unwrap();

        store.fail(id, "boom").await.unwrap();
        let job = store.get_job_by_id("q", id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retry);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn cancel_by_singleton_key_only_touches_in_flight() {
        let store = InMemoryQueueStore::new();
        let opts = SendOptions::builder().singleton_key("full-sync-1").build();
        let id = store
            .send("full-sync", serde_json::json!({}), opts)
            .await
            .unwrap()
            .unwrap();
        store.complete(id, None).await.unwrap();

        let opts2 = SendOptions::builder().singleton_key("full-sync-1").build();
        // with the first job completed, a new send with the same key must succeed
        let second = store.send("full-sync", serde_json::json!({}), opts2).await.unwrap();
        assert!(second.is_some());
    }
}
