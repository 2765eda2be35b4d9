//! Job and send-options model for the durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Lifecycle state of a queued job. Advances monotonically except via
/// explicit `cancel` or `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Created,
    Retry,
    Active,
    Completed,
    Cancelled,
    Failed,
    Expired,
}

impl JobState {
    /// Non-terminal states participate in singleton-key exclusion.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Created | JobState::Retry | JobState::Active)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "schedule_kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Cron,
    Interval,
}

/// Options accepted by `QueueStore::send`.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SendOptions {
    #[builder(default = 30 * 60)]
    pub expire_in_seconds: i64,
    #[builder(default = 1)]
    pub retry_limit: i32,
    #[builder(default = 60)]
    pub retry_delay: i64,
    #[builder(default, setter(strip_option))]
    pub singleton_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub start_after: Option<DateTime<Utc>>,
    #[builder(default = 7 * 24 * 60 * 60)]
    pub retention_seconds: i64,
}

impl SendOptions {
    /// The 4-tier retry table from the scheduler's on-demand triggers.
    pub const STANDARD: (i64, i32, i64) = (30 * 60, 1, 60);
    pub const MEDIUM: (i64, i32, i64) = (60 * 60, 1, 60);
    pub const LONG: (i64, i32, i64) = (2 * 60 * 60, 1, 300);
    pub const EXTENDED: (i64, i32, i64) = (4 * 60 * 60, 1, 300);
    pub const MANUAL_FULL_SYNC: (i64, i32, i64) = (6 * 60 * 60, 1, 300);

    pub fn from_tier(tier: (i64, i32, i64)) -> Self {
        let (expire_in_seconds, retry_limit, retry_delay) = tier;
        Self::builder()
            .expire_in_seconds(expire_in_seconds)
            .retry_limit(retry_limit)
            .retry_delay(retry_delay)
            .build()
    }

    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }
}

/// A row in the durable job queue.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    pub queue_name: String,
    pub payload: serde_json::Value,

    #[builder(default)]
    pub state: JobState,

    #[builder(default = Utc::now())]
    pub created_on: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_on: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub start_after: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_on: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub output: Option<serde_json::Value>,

    #[builder(default = 1)]
    pub retry_limit: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 60)]
    pub retry_delay: i64,

    #[builder(default = 7 * 24 * 60 * 60)]
    pub retention_seconds: i64,
    #[builder(default = 30 * 60)]
    pub expire_in_seconds: i64,

    #[builder(default, setter(strip_option))]
    pub singleton_key: Option<String>,
}

impl Job {
    pub fn new(queue_name: impl Into<String>, payload: serde_json::Value, opts: &SendOptions) -> Self {
        let now = Utc::now();
        Self::builder()
            .queue_name(queue_name.into())
            .payload(payload)
            .retry_limit(opts.retry_limit)
            .retry_delay(opts.retry_delay)
            .retention_seconds(opts.retention_seconds)
            .expire_in_seconds(opts.expire_in_seconds)
            .start_after(opts.start_after.unwrap_or(now))
            .singleton_key(opts.singleton_key.clone())
            .build()
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Created | JobState::Retry) && self.start_after <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_defaults_to_created_state() {
        let opts = SendOptions::builder().build();
        let job = Job::new("activity-sync", serde_json::json!({"serverId": 1}), &opts);
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn is_ready_respects_start_after() {
        let opts = SendOptions::builder()
            .start_after(Utc::now() + chrono::Duration::seconds(60))
            .build();
        let job = Job::new("q", serde_json::json!({}), &opts);
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn send_options_from_tier_matches_standard_table() {
        let opts = SendOptions::from_tier(SendOptions::STANDARD);
        assert_eq!(opts.expire_in_seconds, 1800);
        assert_eq!(opts.retry_limit, 1);
        assert_eq!(opts.retry_delay, 60);
    }

    #[test]
    fn job_state_in_flight_classification() {
        assert!(JobState::Created.is_in_flight());
        assert!(JobState::Retry.is_in_flight());
        assert!(JobState::Active.is_in_flight());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Expired.is_terminal());
    }
}
