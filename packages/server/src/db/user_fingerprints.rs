//! `user_fingerprints` table: known locations/devices per `(serverId, userId)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct UserFingerprint {
    pub server_id: i64,
    pub user_id: i64,
    pub known_countries: Vec<String>,
    pub known_cities: Vec<String>,
    pub known_devices: Vec<String>,
    pub known_clients: Vec<String>,
    pub location_patterns: serde_json::Value,
    pub device_patterns: serde_json::Value,
    pub hour_histogram: serde_json::Value,
    pub avg_sessions_per_day: f64,
    pub total_sessions: i64,
    pub last_calculated_at: Option<DateTime<Utc>>,
}

impl UserFingerprint {
    pub fn empty(server_id: i64, user_id: i64) -> Self {
        Self {
            server_id,
            user_id,
            known_countries: Vec::new(),
            known_cities: Vec::new(),
            known_devices: Vec::new(),
            known_clients: Vec::new(),
            location_patterns: serde_json::json!({}),
            device_patterns: serde_json::json!({}),
            hour_histogram: serde_json::json!({}),
            avg_sessions_per_day: 0.0,
            total_sessions: 0,
            last_calculated_at: None,
        }
    }

    pub fn knows_country(&self, country_code: &str) -> bool {
        self.known_countries.iter().any(|c| c == country_code)
    }

    pub fn knows_city(&self, city: &str) -> bool {
        let normalized = city.trim().to_lowercase();
        self.known_cities.iter().any(|c| c == &normalized)
    }

    pub fn knows_device(&self, device_label: &str) -> bool {
        let normalized = device_label.trim().to_lowercase();
        self.known_devices.iter().any(|d| d == &normalized)
    }

    /// Add a new observation to the known sets, append-only per spec §3's
    /// UserFingerprint invariant (compaction only happens in the full
    /// recompute job).
    pub fn observe(&mut self, country_code: Option<&str>, city: Option<&str>, device_label: Option<&str>) {
        if let Some(c) = country_code {
            if !self.knows_country(c) {
                self.known_countries.push(c.to_string());
            }
        }
        if let Some(c) = city {
            let normalized = c.trim().to_lowercase();
            if !self.known_cities.contains(&normalized) {
                self.known_cities.push(normalized);
            }
        }
        if let Some(d) = device_label {
            let normalized = d.trim().to_lowercase();
            if !self.known_devices.contains(&normalized) {
                self.known_devices.push(normalized);
            }
        }
    }

    pub async fn find(server_id: i64, user_id: i64, pool: &PgPool) -> anyhow::Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT server_id, user_id, known_countries, known_cities, known_devices, known_clients,
                   location_patterns, device_patterns, hour_histogram, avg_sessions_per_day,
                   total_sessions, last_calculated_at
            FROM user_fingerprints
            WHERE server_id = $1 AND user_id = $2
            "#,
        )
        .bind(server_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    pub async fn upsert(&self, pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_fingerprints
                (server_id, user_id, known_countries, known_cities, known_devices, known_clients,
                 location_patterns, device_patterns, hour_histogram, avg_sessions_per_day,
                 total_sessions, last_calculated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (server_id, user_id) DO UPDATE SET
                known_countries = EXCLUDED.known_countries,
                known_cities = EXCLUDED.known_cities,
                known_devices = EXCLUDED.known_devices,
                known_clients = EXCLUDED.known_clients,
                location_patterns = EXCLUDED.location_patterns,
                device_patterns = EXCLUDED.device_patterns,
                hour_histogram = EXCLUDED.hour_histogram,
                avg_sessions_per_day = EXCLUDED.avg_sessions_per_day,
                total_sessions = EXCLUDED.total_sessions,
                last_calculated_at = NOW()
            "#,
        )
        .bind(self.server_id)
        .bind(self.user_id)
        .bind(&self.known_countries)
        .bind(&self.known_cities)
        .bind(&self.known_devices)
        .bind(&self.known_clients)
        .bind(&self.location_patterns)
        .bind(&self.device_patterns)
        .bind(&self.hour_histogram)
        .bind(self.avg_sessions_per_day)
        .bind(self.total_sessions)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Insert-if-absent: seeds a fingerprint from the first observation,
    /// `onConflictDoNothing` (spec §4.6).
    pub async fn seed_if_absent(&self, pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_fingerprints
                (server_id, user_id, known_countries, known_cities, known_devices, known_clients,
                 location_patterns, device_patterns, hour_histogram, avg_sessions_per_day,
                 total_sessions, last_calculated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (server_id, user_id) DO NOTHING
            "#,
        )
        .bind(self.server_id)
        .bind(self.user_id)
        .bind(&self.known_countries)
        .bind(&self.known_cities)
        .bind(&self.known_devices)
        .bind(&self.known_clients)
        .bind(&self.location_patterns)
        .bind(&self.device_patterns)
        .bind(&self.hour_histogram)
        .bind(self.avg_sessions_per_day)
        .bind(self.total_sessions)
        .execute(pool)
        .await?;

        Ok(())
    }
}

/// Aggregation scratch space used by `calculate-fingerprints`'s full
/// recompute, keyed `"country:city"` / device label.
#[derive(Debug, Default)]
pub struct FingerprintAccumulator {
    pub countries: Vec<String>,
    pub cities: Vec<String>,
    pub devices: Vec<String>,
    pub clients: Vec<String>,
    pub location_counts: HashMap<String, i64>,
    pub device_counts: HashMap<String, i64>,
    pub hour_counts: HashMap<u32, i64>,
    pub total_sessions: i64,
    pub distinct_dates: std::collections::HashSet<chrono::NaiveDate>,
}

impl FingerprintAccumulator {
    pub fn avg_sessions_per_day(&self) -> f64 {
        if self.distinct_dates.is_empty() {
            0.0
        } else {
            self.total_sessions as f64 / self.distinct_dates.len() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knows_city_normalizes_case_and_whitespace() {
        let mut fp = UserFingerprint::empty(1, 1);
        fp.observe(None, Some(" Berlin "), None);
        assert!(fp.knows_city("berlin"));
        assert!(fp.knows_city("  BERLIN  "));
    }

    #[test]
    fn observe_is_append_only_and_dedupes() {
        let mut fp = UserFingerprint::empty(1, 1);
        fp.observe(Some("DE"), None, None);
        fp.observe(Some("DE"), None, None);
        assert_eq!(fp.known_countries.len(), 1);
    }

    #[test]
    fn avg_sessions_per_day_divides_by_distinct_dates() {
        let mut acc = FingerprintAccumulator::default();
        acc.total_sessions = 10;
        acc.distinct_dates.insert(chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        acc.distinct_dates.insert(chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
        assert_eq!(acc.avg_sessions_per_day(), 5.0);
    }
}
