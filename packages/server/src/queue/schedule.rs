//! Durable schedule rows ticked by the cron evaluator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::job::SendOptions;

/// `(queueName, scheduleKey) -> { cronExpression, payload, sendOptions }`.
///
/// At most one active schedule exists per key; `QueueStore::schedule` upserts
/// it idempotently.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub queue_name: String,
    pub schedule_key: String,
    pub cron_expression: String,
    pub payload: serde_json::Value,
    pub send_options: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Occurrence the ticker last actually enqueued, `None` before the first run.
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn parsed_send_options(&self) -> anyhow::Result<StoredSendOptions> {
        Ok(serde_json::from_value(self.send_options.clone())?)
    }

    /// Compute the next fire time strictly after `after`.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> anyhow::Result<Option<DateTime<Utc>>> {
        use std::str::FromStr;
        let schedule = cron::Schedule::from_str(&self.cron_expression)
            .map_err(|e| anyhow::anyhow!("invalid cron expression {:?}: {e}", self.cron_expression))?;
        Ok(schedule.after(&after).next())
    }

    /// The next occurrence due as of `now`, anchored on the last occurrence
    /// actually enqueued (or `created_at` if the schedule has never fired).
    /// Returns `None` if no occurrence is due yet.
    pub fn due_occurrence(&self, now: DateTime<Utc>) -> anyhow::Result<Option<DateTime<Utc>>> {
        let anchor = self.last_run_at.unwrap_or(self.created_at);
        Ok(self.next_run_after(anchor)?.filter(|next| *next <= now))
    }

    /// Singleton key identifying one cron occurrence of this schedule, so a
    /// re-tick before `last_run_at` is persisted (crash, slow write) can't
    /// enqueue the same occurrence twice.
    pub fn occurrence_singleton_key(&self, occurrence: DateTime<Utc>) -> String {
        format!("{}:{}:{}", self.queue_name, self.schedule_key, occurrence.timestamp())
    }
}

/// A schedule paired with the specific cron occurrence that is due.
#[derive(Debug, Clone)]
pub struct DueSchedule {
    pub schedule: Schedule,
    pub occurrence: DateTime<Utc>,
}

/// JSON-serializable projection of [`SendOptions`] stored in `schedules.send_options`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSendOptions {
    pub expire_in_seconds: i64,
    pub retry_limit: i32,
    pub retry_delay: i64,
    pub retention_seconds: i64,
}

impl From<&SendOptions> for StoredSendOptions {
    fn from(opts: &SendOptions) -> Self {
        Self {
            expire_in_seconds: opts.expire_in_seconds,
            retry_limit: opts.retry_limit,
            retry_delay: opts.retry_delay,
            retention_seconds: opts.retention_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schedule(cron_expr: &str) -> Schedule {
        Schedule {
            queue_name: "activity-sync".into(),
            schedule_key: "server-1".into(),
            cron_expression: cron_expr.into(),
            payload: serde_json::json!({"serverId": 1}),
            send_options: serde_json::to_value(StoredSendOptions::from(
                &SendOptions::builder().build(),
            ))
            .unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_at: None,
        }
    }

    #[test]
    fn next_run_after_advances_for_every_minute_cron() {
        // cron crate schedules use 6 fields (seconds first).
        let schedule = sample_schedule("0 * * * * *");
        let now = Utc::now();
        let next = schedule.next_run_after(now).unwrap().unwrap();
        assert!(next > now);
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let schedule = sample_schedule("not a cron expression");
        assert!(schedule.next_run_after(Utc::now()).is_err());
    }

    #[test]
    fn due_occurrence_fires_once_then_goes_quiet_until_advanced() {
        let mut schedule = sample_schedule("0 * * * * *");
        schedule.created_at = Utc::now() - chrono::Duration::minutes(5);

        let now = Utc::now();
        let occurrence = schedule.due_occurrence(now).unwrap().expect("an occurrence is due");
        assert!(occurrence <= now);

        // once last_run_at is advanced to that occurrence, the same `now`
        // must not report another one due.
        schedule.last_run_at = Some(occurrence);
        assert!(schedule.due_occurrence(now).unwrap().is_none());
    }

    #[test]
    fn occurrence_singleton_key_is_stable_per_occurrence() {
        let schedule = sample_schedule("0 * * * * *");
        let occurrence = Utc::now();
        assert_eq!(
            schedule.occurrence_singleton_key(occurrence),
            schedule.occurrence_singleton_key(occurrence)
        );
    }
}
