//! `sessions` table: finalized playback sessions, keyed by a stable composite id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSession {
    pub id: String,
    pub server_id: i64,
    pub user_id: Option<i64>,
    pub upstream_session_id: Option<String>,
    pub session_key: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub media_title: Option<String>,
    pub client_name: Option<String>,
    pub ip_address: Option<String>,
    pub completed: bool,
    pub is_transcoded: bool,
    pub raw_data: Option<serde_json::Value>,
}

impl PlaybackSession {
    /// Stable id for a session reported under an upstream session id:
    /// `"sid:<serverId>:<upstreamSessionId>:<startTimeIso>"`. Two ingests of
    /// the same upstream session at the same start time collapse to one row.
    pub fn id_for_upstream(server_id: i64, upstream_session_id: &str, start_time: DateTime<Utc>) -> String {
        format!("sid:{}:{}:{}", server_id, upstream_session_id, start_time.to_rfc3339())
    }

    /// Stable id for a tracked session reported only via a session key:
    /// `"trk:<serverId>:<sessionKey>:<startTimeIso>"`.
    pub fn id_for_tracked(server_id: i64, session_key: &str, start_time: DateTime<Utc>) -> String {
        format!("trk:{}:{}:{}", server_id, session_key, start_time.to_rfc3339())
    }

    pub async fn insert_if_absent(session: &PlaybackSession, pool: &PgPool) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions
                (id, server_id, user_id, upstream_session_id, session_key, start_time, end_time,
                 duration_seconds, media_title, client_name, ip_address, completed, is_transcoded, raw_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&session.id)
        .bind(session.server_id)
        .bind(session.user_id)
        .bind(&session.upstream_session_id)
        .bind(&session.session_key)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.duration_seconds)
        .bind(&session.media_title)
        .bind(&session.client_name)
        .bind(&session.ip_address)
        .bind(session.completed)
        .bind(session.is_transcoded)
        .bind(&session.raw_data)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_for_server(server_id: i64, limit: i64, pool: &PgPool) -> anyhow::Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, server_id, user_id, upstream_session_id, session_key, start_time, end_time,
                   duration_seconds, media_title, client_name, ip_address, completed, is_transcoded, raw_data
            FROM sessions
            WHERE server_id = $1
            ORDER BY start_time DESC
            LIMIT $2
            "#,
        )
        .bind(server_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Most recent finalized session for a user, used to fall back to a
    /// known device/client name when the current activity carries none.
    pub async fn most_recent_for_user(server_id: i64, user_id: i64, pool: &PgPool) -> anyhow::Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, server_id, user_id, upstream_session_id, session_key, start_time, end_time,
                   duration_seconds, media_title, client_name, ip_address, completed, is_transcoded, raw_data
            FROM sessions
            WHERE server_id = $1 AND user_id = $2
            ORDER BY start_time DESC
            LIMIT 1
            "#,
        )
        .bind(server_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn upstream_id_and_tracked_id_never_collide() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let a = PlaybackSession::id_for_upstream(1, "abc", t);
        let b = PlaybackSession::id_for_tracked(1, "abc", t);
        assert_ne!(a, b);
        assert!(a.starts_with("sid:"));
        assert!(b.starts_with("trk:"));
    }

    #[test]
    fn same_upstream_session_and_start_time_produce_same_id() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            PlaybackSession::id_for_upstream(1, "abc", t),
            PlaybackSession::id_for_upstream(1, "abc", t)
        );
    }
}
