//! Read-only interface breaking the Scheduler/SessionPoller cyclic reference.
//!
//! Both components depend on `JobPolicy`; neither imports the other.

pub trait JobPolicy: Send + Sync {
    fn is_enabled(&self, server_id: i64, job_key: &str) -> bool;
    fn effective_cron(&self, server_id: i64, job_key: &str) -> Option<String>;
}
