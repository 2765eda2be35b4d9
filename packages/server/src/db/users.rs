//! `users` table: minimal local mirror of upstream user accounts.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub server_id: i64,
    pub upstream_user_id: String,
    pub name: String,
}

impl User {
    pub async fn find_by_upstream_id(
        server_id: i64,
        upstream_user_id: &str,
        pool: &PgPool,
    ) -> anyhow::Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT id, server_id, upstream_user_id, name FROM users WHERE server_id = $1 AND upstream_user_id = $2",
        )
        .bind(server_id)
        .bind(upstream_user_id)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    pub async fn upsert(
        server_id: i64,
        upstream_user_id: &str,
        name: &str,
        pool: &PgPool,
    ) -> anyhow::Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (server_id, upstream_user_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (server_id, upstream_user_id) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(server_id)
        .bind(upstream_user_id)
        .bind(name)
        .fetch_one(pool)
        .await?;

        Ok(id)
    }
}
