//! Anomaly detection for one (user, activity) pair, backed by an in-batch
//! fingerprint cache so N activities from one user hit the DB once
//! (spec §4.6).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::common::utils::calculate_distance_km;
use crate::db::activity_locations::ActivityLocation;
use crate::db::anomaly_events::{
    is_impossible_travel, severity_for_impossible_travel, AnomalyEvent, AnomalySeverity, AnomalyType,
};
use crate::db::sessions::PlaybackSession;
use crate::db::user_fingerprints::UserFingerprint;

pub struct DetectionInput {
    pub server_id: i64,
    pub user_id: i64,
    pub activity_id: i64,
    pub activity_name: String,
    pub activity_type: String,
    pub activity_date: DateTime<Utc>,
    pub country_code: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct DetectedAnomaly {
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    pub details: serde_json::Value,
}

/// In-batch `(serverId, userId) -> fingerprint` cache shared across one
/// `geolocate-activities` run.
pub struct FingerprintCache {
    pool: PgPool,
    cache: Mutex<HashMap<(i64, i64), UserFingerprint>>,
}

impl FingerprintCache {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_load(&self, server_id: i64, user_id: i64) -> anyhow::Result<Option<UserFingerprint>> {
        if let Some(fp) = self.cache.lock().unwrap().get(&(server_id, user_id)) {
            return Ok(Some(fp.clone()));
        }
        let fp = UserFingerprint::find(server_id, user_id, &self.pool).await?;
        if let Some(ref fp) = fp {
            self.cache.lock().unwrap().insert((server_id, user_id), fp.clone());
        }
        Ok(fp)
    }

    fn put(&self, fp: UserFingerprint) {
        self.cache.lock().unwrap().insert((fp.server_id, fp.user_id), fp);
    }
}

pub struct AnomalyDetector {
    cache: FingerprintCache,
    pool: PgPool,
}

impl AnomalyDetector {
    pub fn new(pool: PgPool) -> Self {
        Self {
            cache: FingerprintCache::new(pool.clone()),
            pool,
        }
    }

    fn device_label(activity_name: &str, activity_type: &str, fallback_device_name: Option<&str>) -> Option<String> {
        let primary = format!("{} {}", activity_name, activity_type);
        let primary = primary.trim();
        if !primary.is_empty() {
            return Some(primary.to_string());
        }
        fallback_device_name.map(|s| s.to_string())
    }

    pub async fn detect(&self, input: DetectionInput) -> anyhow::Result<Vec<DetectedAnomaly>> {
        let mut anomalies = Vec::new();

        let existing = self.cache.get_or_load(input.server_id, input.user_id).await?;

        let mut fingerprint = match existing {
            Some(fp) => fp,
            None => {
                // Seed a brand-new fingerprint from this first observation.
                let mut fp = UserFingerprint::empty(input.server_id, input.user_id);
                fp.observe(Some(&input.country_code), input.city.as_deref(), None);
                fp.seed_if_absent(&self.pool).await?;
                self.cache.put(fp.clone());
                return Ok(anomalies);
            }
        };

        // Impossible travel: compare against the most recent non-private
        // geolocated activity for this user. At most one unresolved
        // impossible-travel anomaly is kept open per user at a time.
        if let (Some(lat), Some(lng)) = (input.lat, input.lng) {
            if let Some((prior, prior_date)) =
                ActivityLocation::most_recent_for_user(input.server_id, input.user_id, input.activity_id, &self.pool).await?
            {
                if let (Some(prior_lat), Some(prior_lng)) = (prior.lat, prior.lng) {
                    let elapsed_minutes = (input.activity_date - prior_date).num_minutes();
                    if elapsed_minutes > 0 {
                        let distance_km = calculate_distance_km(prior_lat, prior_lng, lat, lng);
                        let elapsed_hours = elapsed_minutes as f64 / 60.0;
                        if is_impossible_travel(distance_km, elapsed_hours)
                            && !AnomalyEvent::has_unresolved_impossible_travel(input.user_id, input.activity_id, &self.pool).await?
                        {
                            let speed_kmh = distance_km / elapsed_hours;
                            anomalies.push(DetectedAnomaly {
                                anomaly_type: AnomalyType::ImpossibleTravel,
                                severity: severity_for_impossible_travel(speed_kmh),
                                details: serde_json::json!({
                                    "distanceKm": distance_km,
                                    "speedKmh": speed_kmh,
                                    "priorIpAddress": prior.ip_address,
                                }),
                            });
                        }
                    }
                }
            }
        }

        // New country / new city.
        if !fingerprint.knows_country(&input.country_code) {
            anomalies.push(DetectedAnomaly {
                anomaly_type: AnomalyType::NewCountry,
                severity: AnomalySeverity::Medium,
                details: serde_json::json!({ "countryCode": input.country_code, "country": input.country }),
            });
        } else if let Some(city) = &input.city {
            if !fingerprint.knows_city(city) {
                anomalies.push(DetectedAnomaly {
                    anomaly_type: AnomalyType::NewLocation,
                    severity: AnomalySeverity::Low,
                    details: serde_json::json!({ "city": city }),
                });
            }
        }

        // New device, derived from the activity's name+type, falling back to
        // the user's most recent session's client name when neither is set.
        let fallback_device_name = PlaybackSession::most_recent_for_user(input.server_id, input.user_id, &self.pool)
            .await?
            .and_then(|s| s.client_name);

        if let Some(device_label) = Self::device_label(&input.activity_name, &input.activity_type, fallback_device_name.as_deref()) {
            if !fingerprint.knows_device(&device_label) {
                anomalies.push(DetectedAnomaly {
                    anomaly_type: AnomalyType::NewDevice,
                    severity: AnomalySeverity::Medium,
                    details: serde_json::json!({ "deviceName": device_label }),
                });
            }
        }

        if !anomalies.is_empty() {
            fingerprint.observe(Some(&input.country_code), input.city.as_deref(), None);
            if let Some(device_label) = Self::device_label(&input.activity_name, &input.activity_type, fallback_device_name.as_deref()) {
                fingerprint.observe(None, None, Some(&device_label));
            }
            fingerprint.upsert(&self.pool).await?;
            self.cache.put(fingerprint);
        }

        Ok(anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_label_prefers_activity_name_and_type() {
        let label = AnomalyDetector::device_label("Played", "VideoPlayback", Some("fallback"));
        assert_eq!(label.as_deref(), Some("Played VideoPlayback"));
    }

    #[test]
    fn device_label_falls_back_when_primary_is_empty() {
        let label = AnomalyDetector::device_label("", "", Some("Chrome"));
        assert_eq!(label.as_deref(), Some("Chrome"));
    }
}
