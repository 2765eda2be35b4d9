//! `activities` and `activity_log_cursors` tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub server_id: i64,
    pub name: String,
    pub short_overview: Option<String>,
    pub activity_type: String,
    pub date: DateTime<Utc>,
    pub severity: String,
    pub user_id: Option<i64>,
    pub item_id: Option<String>,
}

impl Activity {
    /// Upsert on conflict update: every column from the upstream payload is
    /// authoritative (spec §4.5 step 5).
    pub async fn upsert_batch(activities: &[Activity], pool: &PgPool) -> anyhow::Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET LOCAL statement_timeout = '10s'")
            .execute(&mut *tx)
            .await?;

        for activity in activities {
            sqlx::query(
                r#"
                INSERT INTO activities (id, server_id, name, short_overview, activity_type, date, severity, user_id, item_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE SET
                    server_id = EXCLUDED.server_id,
                    name = EXCLUDED.name,
                    short_overview = EXCLUDED.short_overview,
                    activity_type = EXCLUDED.activity_type,
                    date = EXCLUDED.date,
                    severity = EXCLUDED.severity,
                    user_id = EXCLUDED.user_id,
                    item_id = EXCLUDED.item_id
                "#,
            )
            .bind(activity.id)
            .bind(activity.server_id)
            .bind(&activity.name)
            .bind(&activity.short_overview)
            .bind(&activity.activity_type)
            .bind(activity.date)
            .bind(&activity.severity)
            .bind(activity.user_id)
            .bind(&activity.item_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn find_unlocated_with_ip(
        server_id: i64,
        batch_size: i64,
        pool: &PgPool,
    ) -> anyhow::Result<Vec<Activity>> {
        let rows = sqlx::query_as::<_, Activity>(
            r#"
            SELECT a.id, a.server_id, a.name, a.short_overview, a.activity_type, a.date, a.severity, a.user_id, a.item_id
            FROM activities a
            LEFT JOIN activity_locations l ON l.activity_id = a.id
            WHERE a.server_id = $1
              AND l.activity_id IS NULL
              AND a.short_overview ILIKE '%IP%'
            ORDER BY a.date
            LIMIT $2
            "#,
        )
        .bind(server_id)
        .bind(batch_size)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogCursor {
    pub server_id: i64,
    pub cursor_date: DateTime<Utc>,
    pub cursor_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl ActivityLogCursor {
    pub async fn find(server_id: i64, pool: &PgPool) -> anyhow::Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT server_id, cursor_date, cursor_id, updated_at FROM activity_log_cursors WHERE server_id = $1",
        )
        .bind(server_id)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    /// Initialize the cursor 10 minutes before now, avoiding a full
    /// history backfill on first contact with a server.
    pub async fn initialize(server_id: i64, now: DateTime<Utc>, pool: &PgPool) -> anyhow::Result<Self> {
        let cursor_date = now - chrono::Duration::minutes(10);
        sqlx::query(
            r#"
            INSERT INTO activity_log_cursors (server_id, cursor_date, cursor_id, updated_at)
            VALUES ($1, $2, NULL, NOW())
            ON CONFLICT (server_id) DO NOTHING
            "#,
        )
        .bind(server_id)
        .bind(cursor_date)
        .execute(pool)
        .await?;

        Ok(Self {
            server_id,
            cursor_date,
            cursor_id: None,
            updated_at: now,
        })
    }

    /// Advance the cursor. Callers must guarantee monotonicity (never move
    /// backward); this is enforced by only ever being called with the
    /// newest accepted row's (date, id).
    pub async fn advance(
        server_id: i64,
        cursor_date: DateTime<Utc>,
        cursor_id: i64,
        pool: &PgPool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE activity_log_cursors
            SET cursor_date = $2, cursor_id = $3, updated_at = NOW()
            WHERE server_id = $1
            "#,
        )
        .bind(server_id)
        .bind(cursor_date)
        .bind(cursor_id)
        .execute(pool)
        .await?;

        Ok(())
    }
}
