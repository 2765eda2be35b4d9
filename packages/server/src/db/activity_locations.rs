//! `activity_locations` table: 1:1 with `activities`.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Row};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLocation {
    pub activity_id: i64,
    pub ip_address: String,
    pub country_code: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub timezone: Option<String>,
    pub is_private_ip: bool,
}

impl ActivityLocation {
    pub fn placeholder(activity_id: i64) -> Self {
        Self {
            activity_id,
            ip_address: "unknown".to_string(),
            country_code: None,
            country: None,
            region: None,
            city: None,
            lat: None,
            lng: None,
            timezone: None,
            is_private_ip: true,
        }
    }

    pub async fn insert_batch(locations: &[ActivityLocation], pool: &PgPool) -> anyhow::Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET LOCAL statement_timeout = '10s'")
            .execute(&mut *tx)
            .await?;

        for loc in locations {
            sqlx::query(
                r#"
                INSERT INTO activity_locations
                    (activity_id, ip_address, country_code, country, region, city, lat, lng, timezone, is_private_ip)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (activity_id) DO NOTHING
                "#,
            )
            .bind(loc.activity_id)
            .bind(&loc.ip_address)
            .bind(&loc.country_code)
            .bind(&loc.country)
            .bind(&loc.region)
            .bind(&loc.city)
            .bind(loc.lat)
            .bind(loc.lng)
            .bind(&loc.timezone)
            .bind(loc.is_private_ip)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Most recent non-private geolocated activity for a user, excluding
    /// `exclude_activity_id`, joined to get the activity's timestamp.
    pub async fn most_recent_for_user(
        server_id: i64,
        user_id: i64,
        exclude_activity_id: i64,
        pool: &PgPool,
    ) -> anyhow::Result<Option<(ActivityLocation, chrono::DateTime<chrono::Utc>)>> {
        let row = sqlx::query(
            r#"
            SELECT
                l.activity_id, l.ip_address, l.country_code, l.country, l.region, l.city,
                l.lat, l.lng, l.timezone, l.is_private_ip,
                a.date
            FROM activity_locations l
            JOIN activities a ON a.id = l.activity_id
            WHERE a.server_id = $1 AND a.user_id = $2 AND a.id != $3 AND l.is_private_ip = false
            ORDER BY a.date DESC
            LIMIT 1
            "#,
        )
        .bind(server_id)
        .bind(user_id)
        .bind(exclude_activity_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| {
            let location = ActivityLocation {
                activity_id: r.get("activity_id"),
                ip_address: r.get("ip_address"),
                country_code: r.get("country_code"),
                country: r.get("country"),
                region: r.get("region"),
                city: r.get("city"),
                lat: r.get("lat"),
                lng: r.get("lng"),
                timezone: r.get("timezone"),
                is_private_ip: r.get("is_private_ip"),
            };
            let date = r.get("date");
            (location, date)
        }))
    }
}
