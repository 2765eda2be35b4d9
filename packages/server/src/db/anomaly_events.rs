//! `anomaly_events` table: security findings raised by the geolocation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "anomaly_type", rename_all = "snake_case")]
pub enum AnomalyType {
    ImpossibleTravel,
    NewCountry,
    NewLocation,
    NewDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "anomaly_severity", rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: i64,
    pub server_id: i64,
    pub user_id: i64,
    pub activity_id: i64,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub details: serde_json::Value,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AnomalyEvent {
    /// Impossible-travel anomalies are deduplicated per `(userId, activityId)`
    /// while unresolved; other anomaly kinds may repeat freely.
    pub async fn has_unresolved_impossible_travel(
        user_id: i64,
        activity_id: i64,
        pool: &PgPool,
    ) -> anyhow::Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM anomaly_events
                WHERE user_id = $1 AND activity_id = $2
                  AND anomaly_type = 'impossible_travel' AND resolved = false
            )
            "#,
        )
        .bind(user_id)
        .bind(activity_id)
        .fetch_one(pool)
        .await?;

        Ok(exists)
    }

    pub async fn insert(
        server_id: i64,
        user_id: i64,
        activity_id: i64,
        anomaly_type: AnomalyType,
        severity: AnomalySeverity,
        details: serde_json::Value,
        pool: &PgPool,
    ) -> anyhow::Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO anomaly_events (server_id, user_id, activity_id, anomaly_type, severity, details, resolved, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, false, NOW())
            RETURNING id
            "#,
        )
        .bind(server_id)
        .bind(user_id)
        .bind(activity_id)
        .bind(anomaly_type)
        .bind(severity)
        .bind(details)
        .fetch_one(pool)
        .await?;

        Ok(id)
    }

    /// One-way transition: resolved events never revert to unresolved.
    pub async fn resolve(id: i64, pool: &PgPool) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE anomaly_events SET resolved = true, resolved_at = NOW() WHERE id = $1 AND resolved = false",
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn find_for_server(server_id: i64, limit: i64, pool: &PgPool) -> anyhow::Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, server_id, user_id, activity_id, anomaly_type, severity, details, resolved, resolved_at, created_at
            FROM anomaly_events
            WHERE server_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(server_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }
}

/// Classifies travel between two points per spec §4.6's suggested
/// thresholds: distance > 500km AND implied speed > 800km/h.
pub fn is_impossible_travel(distance_km: f64, elapsed_hours: f64) -> bool {
    if elapsed_hours <= 0.0 {
        return distance_km > 500.0;
    }
    let speed_kmh = distance_km / elapsed_hours;
    distance_km > 500.0 && speed_kmh > 800.0
}

pub fn severity_for_impossible_travel(speed_kmh: f64) -> AnomalySeverity {
    if speed_kmh > 2000.0 {
        AnomalySeverity::Critical
    } else if speed_kmh > 1200.0 {
        AnomalySeverity::High
    } else {
        AnomalySeverity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impossible_travel_requires_both_distance_and_speed() {
        assert!(is_impossible_travel(6000.0, 1.0));
        assert!(!is_impossible_travel(100.0, 0.01));
        assert!(!is_impossible_travel(600.0, 10.0));
    }

    #[test]
    fn zero_elapsed_time_with_large_distance_is_impossible() {
        assert!(is_impossible_travel(1000.0, 0.0));
    }

    #[test]
    fn severity_escalates_with_speed() {
        assert_eq!(severity_for_impossible_travel(3000.0), AnomalySeverity::Critical);
        assert_eq!(severity_for_impossible_travel(1500.0), AnomalySeverity::High);
        assert_eq!(severity_for_impossible_travel(900.0), AnomalySeverity::Medium);
    }
}
