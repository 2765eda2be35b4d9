//! SSE event stream for the HTTP admin/query surface: a ring buffer of
//! recent events supporting `?since=<epoch>` replay (spec §4.7, §6).

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

const RING_BUFFER_CAPACITY: usize = 512;
const HEARTBEAT_SECONDS: u64 = 15;

/// One published event. `seq` is strictly increasing even when two events
/// share a microsecond-resolution timestamp, so `?since=<epoch>` replay is
/// unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub seq: i64,
    pub event_type: String,
    #[serde(serialize_with = "serialize_timestamp_micros")]
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Fixed 6-digit microsecond precision, so replay consumers parsing the
/// fractional-second width don't have to handle chrono's variable trailing
/// zeros.
fn serialize_timestamp_micros<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
}

/// Shared broadcaster: a bounded ring buffer plus a tokio broadcast channel
/// for live subscribers.
pub struct SseBroadcaster {
    next_seq: AtomicI64,
    ring: Mutex<VecDeque<StreamEvent>>,
    sender: tokio::sync::broadcast::Sender<StreamEvent>,
}

impl Default for SseBroadcaster {
    fn default() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(RING_BUFFER_CAPACITY);
        Self {
            next_seq: AtomicI64::new(1),
            ring: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            sender,
        }
    }
}

impl SseBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event_type: impl Into<String>, payload: serde_json::Value) {
        let event = StreamEvent {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        };

        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() == RING_BUFFER_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        // No live subscribers is not an error; the event is still buffered.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    /// Events with `seq` strictly greater than `since`, oldest first.
    pub fn since(&self, since: i64) -> Vec<StreamEvent> {
        self.ring.lock().unwrap().iter().filter(|e| e.seq > since).cloned().collect()
    }
}

#[derive(Clone)]
pub struct SseState {
    pub broadcaster: std::sync::Arc<SseBroadcaster>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub since: Option<i64>,
}

pub async fn stream_handler(
    State(state): State<SseState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let replay = query.since.map(|s| state.broadcaster.since(s)).unwrap_or_default();
    let rx = state.broadcaster.subscribe();

    let replay_stream = stream::iter(replay.into_iter().map(to_sse_event));
    let live_stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => Some(to_sse_event(event)),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => Some(Ok::<_, Infallible>(
                SseEvent::default().event("lagged").data(n.to_string()),
            )),
        }
    });

    Sse::new(replay_stream.chain(live_stream)).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(HEARTBEAT_SECONDS)))
}

fn to_sse_event(event: StreamEvent) -> Result<SseEvent, Infallible> {
    Ok(SseEvent::default()
        .id(event.seq.to_string())
        .event(event.event_type.clone())
        .json_data(&event)
        .unwrap_or_else(|_| SseEvent::default().event("error").data("serialization failed")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_assigns_monotonic_seq() {
        let broadcaster = SseBroadcaster::new();
        broadcaster.publish("started", serde_json::json!({}));
        broadcaster.publish("progress", serde_json::json!({}));
        let all = broadcaster.since(0);
        assert_eq!(all.len(), 2);
        assert!(all[0].seq < all[1].seq);
    }

    #[test]
    fn since_excludes_already_seen_events() {
        let broadcaster = SseBroadcaster::new();
        broadcaster.publish("a", serde_json::json!({}));
        let marker = broadcaster.since(0)[0].seq;
        broadcaster.publish("b", serde_json::json!({}));
        let replay = broadcaster.since(marker);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event_type, "b");
    }

    #[test]
    fn timestamp_serializes_with_fixed_microsecond_width() {
        let broadcaster = SseBroadcaster::new();
        broadcaster.publish("started", serde_json::json!({}));
        let event = broadcaster.since(0).remove(0);
        let value = serde_json::to_value(&event).unwrap();
        let ts = value["timestamp"].as_str().unwrap();
        let fractional = ts.trim_end_matches('Z').rsplit('.').next().unwrap();
        assert_eq!(fractional.len(), 6);
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let broadcaster = SseBroadcaster::new();
        for i in 0..(RING_BUFFER_CAPACITY + 10) {
            broadcaster.publish("tick", serde_json::json!({ "i": i }));
        }
        let all = broadcaster.since(0);
        assert_eq!(all.len(), RING_BUFFER_CAPACITY);
    }
}
