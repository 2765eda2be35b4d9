//! Postgres entity layer: servers, configuration overrides, activities,
//! sessions, geolocation, and the fingerprint/anomaly tables it all feeds.

pub mod active_sessions;
pub mod activities;
pub mod activity_locations;
pub mod anomaly_events;
pub mod server_job_configurations;
pub mod servers;
pub mod sessions;
pub mod user_fingerprints;
pub mod users;

pub use active_sessions::ActiveSession;
pub use activities::{Activity, ActivityLogCursor};
pub use activity_locations::ActivityLocation;
pub use anomaly_events::{AnomalyEvent, AnomalySeverity, AnomalyType};
pub use server_job_configurations::{OverrideCache, ServerJobConfiguration};
pub use servers::{Server, SyncStatus};
pub use sessions::PlaybackSession;
pub use user_fingerprints::UserFingerprint;
pub use users::User;
