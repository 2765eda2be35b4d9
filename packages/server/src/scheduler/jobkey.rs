//! The closed set of job keys the scheduler reconciles into QueueStore schedules.

use crate::queue::SendOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKey {
    ActivitySync,
    RecentItemsSync,
    UserSync,
    PeopleSync,
    EmbeddingsSync,
    FullSync,
    GeolocationSync,
    FingerprintSync,
}

impl JobKey {
    pub const ALL: [JobKey; 8] = [
        JobKey::ActivitySync,
        JobKey::RecentItemsSync,
        JobKey::UserSync,
        JobKey::PeopleSync,
        JobKey::EmbeddingsSync,
        JobKey::FullSync,
        JobKey::GeolocationSync,
        JobKey::FingerprintSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKey::ActivitySync => "activity-sync",
            JobKey::RecentItemsSync => "recent-items-sync",
            JobKey::UserSync => "user-sync",
            JobKey::PeopleSync => "people-sync",
            JobKey::EmbeddingsSync => "embeddings-sync",
            JobKey::FullSync => "full-sync",
            JobKey::GeolocationSync => "geolocation-sync",
            JobKey::FingerprintSync => "fingerprint-sync",
        }
    }

    /// Queue name a job key dispatches into; 1:1 with the job key string in
    /// this crate but kept distinct since a future queue could fan multiple
    /// keys into one handler.
    pub fn queue_name(&self) -> &'static str {
        self.as_str()
    }

    pub fn default_cron(&self) -> &'static str {
        match self {
            JobKey::ActivitySync => "*/5 * * * *",
            JobKey::RecentItemsSync => "*/15 * * * *",
            JobKey::UserSync => "0 * * * *",
            JobKey::PeopleSync => "0 */6 * * *",
            JobKey::EmbeddingsSync => "0 2 * * *",
            JobKey::FullSync => "0 3 * * *",
            JobKey::GeolocationSync => "*/10 * * * *",
            JobKey::FingerprintSync => "0 4 * * *",
        }
    }

    /// Tiered retry/expiry budget applied to this job key's scheduled runs.
    pub fn send_options(&self) -> SendOptions {
        match self {
            JobKey::ActivitySync | JobKey::UserSync | JobKey::GeolocationSync => {
                SendOptions::from_tier(SendOptions::STANDARD)
            }
            JobKey::RecentItemsSync | JobKey::PeopleSync => SendOptions::from_tier(SendOptions::MEDIUM),
            JobKey::EmbeddingsSync | JobKey::FingerprintSync => SendOptions::from_tier(SendOptions::LONG),
            JobKey::FullSync => SendOptions::from_tier(SendOptions::EXTENDED),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single interval-driven key, consumed by SessionPoller directly and
/// never turned into a QueueStore schedule row.
pub const SESSION_POLLING_JOB_KEY: &str = "session-polling";

/// Global (not per-server) maintenance keys, collapsed into one minutely
/// `scheduler-maintenance` schedule that dispatches internally by minute/hour.
pub const SCHEDULER_MAINTENANCE_QUEUE: &str = "scheduler-maintenance";
pub const SCHEDULER_MAINTENANCE_CRON: &str = "* * * * *";

pub fn singleton_key_for_server(server_id: i64) -> String {
    format!("server-{}", server_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_queue_name_matches_catalog_string() {
        assert_eq!(JobKey::ActivitySync.as_str(), "activity-sync");
        assert_eq!(JobKey::FullSync.queue_name(), "full-sync");
    }

    #[test]
    fn singleton_key_is_per_server() {
        assert_eq!(singleton_key_for_server(42), "server-42");
    }

    #[test]
    fn all_eight_cron_keys_present() {
        assert_eq!(JobKey::ALL.len(), 8);
    }
}
