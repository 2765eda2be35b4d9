//! Job lifecycle events, consumed by [`crate::sse`] to push progress to
//! HTTP clients. Mirrors the shape (not the transport) of the teacher's
//! `kernel/jobs/events.rs`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    Started {
        job_id: Uuid,
        queue_name: String,
    },
    Succeeded {
        job_id: Uuid,
        queue_name: String,
        duration_ms: u64,
    },
    Failed {
        job_id: Uuid,
        queue_name: String,
        error: String,
        will_retry: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_event_serializes() {
        let event = JobEvent::Started {
            job_id: Uuid::nil(),
            queue_name: "activity-sync".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Started"));
    }
}
