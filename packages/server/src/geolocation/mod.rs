//! Geolocation backfill and fingerprint recomputation (spec §4.6, §4.7).

pub mod anomaly;
pub mod ip_resolver;
pub mod pipeline;

pub use anomaly::{AnomalyDetector, DetectedAnomaly, DetectionInput};
pub use ip_resolver::{GeoResolution, HttpIpResolver, IpResolver};
pub use pipeline::GeolocationPipeline;
