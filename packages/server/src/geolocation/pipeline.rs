//! `geolocate-activities`, `calculate-fingerprints`, and
//! `backfill-activity-locations` (spec §4.6, §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Timelike;
use sqlx::{PgPool, Row};

use crate::db::activities::Activity;
use crate::db::activity_locations::ActivityLocation;
use crate::db::user_fingerprints::{FingerprintAccumulator, UserFingerprint};
use crate::geolocation::anomaly::{AnomalyDetector, DetectionInput};
use crate::geolocation::ip_resolver::IpResolver;
use crate::sse::SseBroadcaster;

const GEOLOCATE_BATCH_SIZE: i64 = 100;
const BACKFILL_BATCH_SIZE: i64 = 500;
const BACKFILL_HARD_CAP: i64 = 100_000;

pub struct GeolocationPipeline {
    pool: PgPool,
    resolver: Arc<dyn IpResolver>,
    detector: AnomalyDetector,
}

/// Result of one `geolocate-activities` batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeolocateBatchResult {
    pub processed: i64,
    pub anomalies_detected: i64,
}

impl GeolocationPipeline {
    pub fn new(pool: PgPool, resolver: Arc<dyn IpResolver>) -> Self {
        let detector = AnomalyDetector::new(pool.clone());
        Self { pool, resolver, detector }
    }

    /// One batch of `geolocate-activities`: resolve IPs embedded in
    /// `shortOverview`, detect anomalies for geolocated, non-private
    /// activities with a known user, and persist all results.
    pub async fn geolocate_activities(&self, server_id: i64, batch_size: i64) -> anyhow::Result<GeolocateBatchResult> {
        let activities = Activity::find_unlocated_with_ip(server_id, batch_size, &self.pool).await?;
        let mut locations = Vec::with_capacity(activities.len());
        let mut anomalies_detected = 0i64;

        for activity in &activities {
            let ip_address = activity.short_overview.as_deref().and_then(extract_ip_address);

            let Some(ip_address) = ip_address else {
                locations.push(ActivityLocation::placeholder(activity.id));
                continue;
            };

            let resolution = self.resolver.resolve(&ip_address).await?;

            if let (Some(user_id), Some(country_code)) = (activity.user_id, resolution.country_code.clone()) {
                if !resolution.is_private_ip {
                    let input = DetectionInput {
                        server_id,
                        user_id,
                        activity_id: activity.id,
                        activity_name: activity.name.clone(),
                        activity_type: activity.activity_type.clone(),
                        activity_date: activity.date,
                        country_code,
                        country: resolution.country.clone(),
                        city: resolution.city.clone(),
                        lat: resolution.lat,
                        lng: resolution.lng,
                    };
                    anomalies_detected += self.detector.detect(input).await?.len() as i64;
                }
            }

            locations.push(ActivityLocation {
                activity_id: activity.id,
                ip_address,
                country_code: resolution.country_code,
                country: resolution.country,
                region: resolution.region,
                city: resolution.city,
                lat: resolution.lat,
                lng: resolution.lng,
                timezone: resolution.timezone,
                is_private_ip: resolution.is_private_ip,
            });
        }

        let processed = locations.len() as i64;
        if !locations.is_empty() {
            ActivityLocation::insert_batch(&locations, &self.pool).await?;
        }

        Ok(GeolocateBatchResult { processed, anomalies_detected })
    }

    /// Loop `geolocate-activities` until a batch returns fewer rows than
    /// requested, capped at `BACKFILL_HARD_CAP` activities, emitting
    /// progress events as it goes.
    pub async fn backfill_activity_locations(
        &self,
        server_id: i64,
        broadcaster: &SseBroadcaster,
    ) -> anyhow::Result<GeolocateBatchResult> {
        let mut totals = GeolocateBatchResult::default();

        loop {
            let batch = self.geolocate_activities(server_id, BACKFILL_BATCH_SIZE).await?;
            totals.processed += batch.processed;
            totals.anomalies_detected += batch.anomalies_detected;

            broadcaster.publish(
                "progress",
                serde_json::json!({
                    "serverId": server_id,
                    "processed": totals.processed,
                    "anomaliesDetected": totals.anomalies_detected,
                }),
            );

            if batch.processed < BACKFILL_BATCH_SIZE || totals.processed >= BACKFILL_HARD_CAP {
                break;
            }
        }

        Ok(totals)
    }

    /// Full recompute of every user's fingerprint for a server: known
    /// countries/cities/devices/clients, location/device histograms, an
    /// hour-of-day histogram, and average sessions per day.
    pub async fn calculate_fingerprints(&self, server_id: i64) -> anyhow::Result<usize> {
        let mut accumulators: HashMap<i64, FingerprintAccumulator> = HashMap::new();

        let location_rows = sqlx::query(
            r#"
            SELECT a.user_id, l.country_code, l.city, a.name, a.activity_type
            FROM activities a
            JOIN activity_locations l ON l.activity_id = a.id
            WHERE a.server_id = $1 AND a.user_id IS NOT NULL AND l.is_private_ip = false
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        for row in &location_rows {
            let user_id: i64 = row.get("user_id");
            let country_code: Option<String> = row.get("country_code");
            let city: Option<String> = row.get("city");
            let name: String = row.get("name");
            let activity_type: String = row.get("activity_type");

            let acc = accumulators.entry(user_id).or_default();

            if let Some(country_code) = &country_code {
                if !acc.countries.iter().any(|c| c == country_code) {
                    acc.countries.push(country_code.clone());
                }
            }
            if let Some(city) = &city {
                let normalized = city.trim().to_lowercase();
                if !acc.cities.contains(&normalized) {
                    acc.cities.push(normalized);
                }
            }

            let key = format!("{}:{}", country_code.unwrap_or_default(), city.unwrap_or_default());
            *acc.location_counts.entry(key).or_insert(0) += 1;

            let device_label = format!("{} {}", name, activity_type).trim().to_lowercase();
            if !device_label.is_empty() {
                if !acc.devices.contains(&device_label) {
                    acc.devices.push(device_label.clone());
                }
                *acc.device_counts.entry(device_label).or_insert(0) += 1;
            }
        }

        let session_rows = sqlx::query(
            r#"
            SELECT user_id, start_time, client_name
            FROM sessions
            WHERE server_id = $1 AND user_id IS NOT NULL
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        for row in &session_rows {
            let user_id: i64 = row.get("user_id");
            let start_time: chrono::DateTime<chrono::Utc> = row.get("start_time");
            let client_name: Option<String> = row.get("client_name");

            let acc = accumulators.entry(user_id).or_default();
            acc.total_sessions += 1;
            acc.distinct_dates.insert(start_time.date_naive());
            *acc.hour_counts.entry(start_time.hour()).or_insert(0) += 1;
            if let Some(client_name) = client_name {
                if !acc.clients.contains(&client_name) {
                    acc.clients.push(client_name);
                }
            }
        }

        let user_count = accumulators.len();

        for (user_id, acc) in accumulators {
            let mut fingerprint = UserFingerprint::empty(server_id, user_id);
            fingerprint.known_countries = acc.countries;
            fingerprint.known_cities = acc.cities;
            fingerprint.known_devices = acc.devices;
            fingerprint.known_clients = acc.clients;
            fingerprint.location_patterns = serde_json::to_value(&acc.location_counts)?;
            fingerprint.device_patterns = serde_json::to_value(&acc.device_counts)?;
            fingerprint.hour_histogram =
                serde_json::to_value(acc.hour_counts.iter().map(|(h, c)| (h.to_string(), c)).collect::<HashMap<_, _>>())?;
            fingerprint.total_sessions = acc.total_sessions;
            fingerprint.avg_sessions_per_day = acc.avg_sessions_per_day();
            fingerprint.upsert(&self.pool).await?;
        }

        Ok(user_count)
    }
}

/// Extract the first dotted-quad IPv4 address found in `text`, as upstream
/// activity log entries embed it inline (e.g. `"... from 203.0.113.7"`).
fn extract_ip_address(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    for start in 0..bytes.len() {
        if !bytes[start].is_ascii_digit() {
            continue;
        }
        if start > 0 && (bytes[start - 1].is_ascii_digit() || bytes[start - 1] == b'.') {
            continue;
        }
        let rest = &text[start..];
        let candidate: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if is_ipv4(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_ipv4(candidate: &str) -> bool {
    let parts: Vec<&str> = candidate.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|p| {
            !p.is_empty() && p.len() <= 3 && p.chars().all(|c| c.is_ascii_digit()) && p.parse::<u16>().map(|n| n <= 255).unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ip_from_short_overview() {
        assert_eq!(
            extract_ip_address("User logged in from 203.0.113.7 using Chrome"),
            Some("203.0.113.7".to_string())
        );
    }

    #[test]
    fn returns_none_when_no_ip_present() {
        assert_eq!(extract_ip_address("User logged in using Chrome"), None);
    }

    #[test]
    fn rejects_out_of_range_octets() {
        assert_eq!(extract_ip_address("bogus 999.999.999.999 address"), None);
    }

    #[test]
    fn extracts_first_of_multiple_candidates() {
        assert_eq!(
            extract_ip_address("from 10.0.0.1 forwarded by 203.0.113.7"),
            Some("10.0.0.1".to_string())
        );
    }
}
