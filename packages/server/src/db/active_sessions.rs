//! `active_sessions` table: tracked-session snapshots kept live by the poller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    pub server_id: i64,
    pub session_key: String,
    pub payload: serde_json::Value,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActiveSession {
    pub async fn find_all_for_server(server_id: i64, pool: &PgPool) -> anyhow::Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT server_id, session_key, payload, last_seen_at, updated_at FROM active_sessions WHERE server_id = $1",
        )
        .bind(server_id)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    pub async fn upsert(
        server_id: i64,
        session_key: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
        pool: &PgPool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO active_sessions (server_id, session_key, payload, last_seen_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (server_id, session_key) DO UPDATE SET
                payload = EXCLUDED.payload,
                last_seen_at = EXCLUDED.last_seen_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(server_id)
        .bind(session_key)
        .bind(payload)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn remove(server_id: i64, session_key: &str, pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_sessions WHERE server_id = $1 AND session_key = $2")
            .bind(server_id)
            .bind(session_key)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Sessions not refreshed since `cutoff`: the poller has stopped seeing
    /// them upstream and they should be finalized.
    pub async fn find_stale(server_id: i64, cutoff: DateTime<Utc>, pool: &PgPool) -> anyhow::Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT server_id, session_key, payload, last_seen_at, updated_at FROM active_sessions WHERE server_id = $1 AND last_seen_at < $2",
        )
        .bind(server_id)
        .bind(cutoff)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }
}
