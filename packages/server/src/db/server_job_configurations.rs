//! `server_job_configurations` table: per-(server, jobKey) schedule overrides.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ServerJobConfiguration {
    pub server_id: i64,
    pub job_key: String,
    pub enabled: bool,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
}

impl ServerJobConfiguration {
    pub async fn find_all(pool: &PgPool) -> anyhow::Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT server_id, job_key, enabled, cron_expression, interval_seconds FROM server_job_configurations",
        )
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    pub async fn find_for_server(server_id: i64, pool: &PgPool) -> anyhow::Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT server_id, job_key, enabled, cron_expression, interval_seconds FROM server_job_configurations WHERE server_id = $1",
        )
        .bind(server_id)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }
}

/// Two-level in-memory cache of overrides: `serverId -> jobKey -> config`.
/// An absent entry means "enabled with defaults", per spec §3.
#[derive(Debug, Clone, Default)]
pub struct OverrideCache {
    by_server: HashMap<i64, HashMap<String, ServerJobConfiguration>>,
}

impl OverrideCache {
    pub fn load(rows: Vec<ServerJobConfiguration>) -> Self {
        let mut by_server: HashMap<i64, HashMap<String, ServerJobConfiguration>> = HashMap::new();
        for row in rows {
            by_server
                .entry(row.server_id)
                .or_default()
                .insert(row.job_key.clone(), row);
        }
        Self { by_server }
    }

    pub fn get(&self, server_id: i64, job_key: &str) -> Option<&ServerJobConfiguration> {
        self.by_server.get(&server_id)?.get(job_key)
    }

    pub fn set_for_server(&mut self, server_id: i64, rows: Vec<ServerJobConfiguration>) {
        let map = rows
            .into_iter()
            .map(|row| (row.job_key.clone(), row))
            .collect();
        self.by_server.insert(server_id, map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_override_returns_none() {
        let cache = OverrideCache::default();
        assert!(cache.get(1, "activity-sync").is_none());
    }

    #[test]
    fn load_indexes_by_server_and_job_key() {
        let cache = OverrideCache::load(vec![ServerJobConfiguration {
            server_id: 1,
            job_key: "activity-sync".into(),
            enabled: false,
            cron_expression: None,
            interval_seconds: None,
        }]);
        let entry = cache.get(1, "activity-sync").unwrap();
        assert!(!entry.enabled);
    }
}
