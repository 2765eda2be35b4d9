//! `servers` table: the UMS instances this crate observes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "sync_status", rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Syncing,
    Completed,
    Failed,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub upstream_id: Option<i64>,
    pub url: String,
    pub api_key: String,
    pub sync_status: SyncStatus,
    pub sync_progress: Option<String>,
    pub sync_error: Option<String>,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Server {
    pub async fn find_all(pool: &PgPool) -> anyhow::Result<Vec<Self>> {
        let servers = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, upstream_id, url, api_key, sync_status, sync_progress, sync_error,
                   last_sync_started, last_sync_completed, created_at, updated_at
            FROM servers
            ORDER BY id
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(servers)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> anyhow::Result<Option<Self>> {
        let server = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, upstream_id, url, api_key, sync_status, sync_progress, sync_error,
                   last_sync_started, last_sync_completed, created_at, updated_at
            FROM servers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(server)
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_status == SyncStatus::Syncing
    }

    pub fn is_stale_syncing(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.sync_status == SyncStatus::Syncing
            && self
                .last_sync_started
                .map(|started| now - started > stale_after)
                .unwrap_or(true)
    }

    pub async fn start_sync(id: i64, pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE servers
            SET sync_status = 'syncing', sync_error = NULL, last_sync_started = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn complete_sync(id: i64, pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE servers
            SET sync_status = 'completed', sync_progress = 'completed', last_sync_completed = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn fail_sync(id: i64, error: &str, pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE servers
            SET sync_status = 'failed', sync_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Reset every server stuck in `syncing` for longer than `stale_after`
    /// (or with a null `lastSyncStarted`) back to `pending`. Returns the
    /// number of rows reset, for the maintenance tick's log line.
    pub async fn reset_stale_syncing(
        stale_after: chrono::Duration,
        pool: &PgPool,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE servers
            SET sync_status = 'pending', sync_error = NULL, updated_at = NOW()
            WHERE sync_status = 'syncing'
              AND (last_sync_started IS NULL OR last_sync_started < NOW() - ($1 || ' seconds')::INTERVAL)
            "#,
        )
        .bind(stale_after.num_seconds().to_string())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Startup cleanup: reset every syncing server unconditionally, per
    /// the scheduler's startup sequence step 2. Returns reset count.
    pub async fn reset_all_syncing(pool: &PgPool) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"UPDATE servers SET sync_status = 'pending', sync_error = NULL, updated_at = NOW() WHERE sync_status = 'syncing'"#,
        )
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn any_missing_upstream_id(pool: &PgPool) -> anyhow::Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM servers WHERE upstream_id IS NULL)")
                .fetch_one(pool)
                .await?;

        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_server(sync_status: SyncStatus, last_sync_started: Option<DateTime<Utc>>) -> Server {
        Server {
            id: 1,
            upstream_id: None,
            url: "http://ums.local".into(),
            api_key: "key".into(),
            sync_status,
            sync_progress: None,
            sync_error: None,
            last_sync_started,
            last_sync_completed: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn stale_syncing_detects_30_min_old_sync() {
        let server = sample_server(SyncStatus::Syncing, Some(Utc::now() - chrono::Duration::minutes(45)));
        assert!(server.is_stale_syncing(Utc::now(), chrono::Duration::minutes(30)));
    }

    #[test]
    fn stale_syncing_null_started_is_stale() {
        let server = sample_server(SyncStatus::Syncing, None);
        assert!(server.is_stale_syncing(Utc::now(), chrono::Duration::minutes(30)));
    }

    #[test]
    fn stale_syncing_recent_sync_is_not_stale() {
        let server = sample_server(SyncStatus::Syncing, Some(Utc::now() - chrono::Duration::minutes(5)));
        assert!(!server.is_stale_syncing(Utc::now(), chrono::Duration::minutes(30)));
    }

    #[test]
    fn non_syncing_server_is_never_stale() {
        let server = sample_server(SyncStatus::Completed, None);
        assert!(!server.is_stale_syncing(Utc::now(), chrono::Duration::minutes(30)));
    }
}
