//! Durable, Postgres-backed job queue: the QueueStore component (spec §4.1).

pub mod events;
pub mod job;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod ticker;
pub mod worker;

pub use events::JobEvent;
pub use job::{Job, JobState, SendOptions};
pub use registry::JobRegistry;
pub use schedule::{DueSchedule, Schedule};
pub use store::{PgQueueStore, QueueDefaults, QueueStats, QueueStore};
