//! Per-session state machine: reconstructs playback sessions from repeated
//! point-in-time snapshots, accumulating watch duration across poll ticks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::sessions::PlaybackSession;

const POSITION_RESET_HIGH_WATERMARK_TICKS: i64 = 600_000_000;
const POSITION_RESET_LOW_WATERMARK_TICKS: i64 = 100_000_000;
const POSITION_RESET_MIN_PLAY_DURATION_SECONDS: i64 = 30;
const FINALIZE_MIN_DURATION_SECONDS: i64 = 1;
const COMPLETED_PERCENT_THRESHOLD: f64 = 90.0;

/// One point-in-time session snapshot as reported by the UMS sessions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowPlayingSnapshot {
    pub upstream_session_id: Option<String>,
    pub upstream_user_id: Option<String>,
    pub device_id: Option<String>,
    pub series_id: Option<String>,
    pub item_id: Option<String>,
    pub item_type: Option<String>,
    pub provider_ids: Vec<String>,
    pub item_name: Option<String>,
    pub client_name: Option<String>,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub position_ticks: i64,
    pub runtime_ticks: i64,
    pub is_paused: bool,
    pub play_method: String,
}

impl NowPlayingSnapshot {
    pub fn is_trailer_or_preroll(&self) -> bool {
        self.item_type.as_deref() == Some("Trailer")
            || self.provider_ids.iter().any(|p| p == "prerolls.video")
    }

    /// Stable across ticks: prefer the upstream session id.
    pub fn session_key(&self) -> String {
        if let Some(id) = &self.upstream_session_id {
            return format!("sid:{}", id);
        }
        format!(
            "{}|{}|{}|{}",
            self.upstream_user_id.as_deref().unwrap_or(""),
            self.device_id.as_deref().unwrap_or(""),
            self.series_id.as_deref().unwrap_or(""),
            self.item_id.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLifecycle {
    New,
    ActivePlaying,
    ActivePaused,
    Finalized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedSession {
    pub session_key: String,
    pub server_id: i64,
    pub upstream_session_id: Option<String>,
    pub upstream_user_id: Option<String>,
    pub local_user_id: Option<i64>,
    pub item_id: Option<String>,
    pub item_name: Option<String>,
    pub client_name: Option<String>,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub position_ticks: i64,
    pub runtime_ticks: i64,
    pub play_duration_seconds: i64,
    pub is_paused: bool,
    pub was_paused: bool,
    pub play_method: String,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    /// The last raw now-playing snapshot reported for this session, carried
    /// through to `finalize()`'s `rawData` diagnostics field.
    pub last_raw_snapshot: serde_json::Value,
}

impl TrackedSession {
    pub fn new(server_id: i64, snapshot: &NowPlayingSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            session_key: snapshot.session_key(),
            server_id,
            upstream_session_id: snapshot.upstream_session_id.clone(),
            upstream_user_id: snapshot.upstream_user_id.clone(),
            local_user_id: None,
            item_id: snapshot.item_id.clone(),
            item_name: snapshot.item_name.clone(),
            client_name: snapshot.client_name.clone(),
            device_name: snapshot.device_name.clone(),
            ip_address: snapshot.ip_address.clone(),
            position_ticks: snapshot.position_ticks,
            runtime_ticks: snapshot.runtime_ticks,
            play_duration_seconds: 0,
            is_paused: snapshot.is_paused,
            was_paused: snapshot.is_paused,
            play_method: snapshot.play_method.clone(),
            start_time: now,
            last_update_time: now,
            last_raw_snapshot: serde_json::to_value(snapshot).unwrap_or(serde_json::json!({})),
        }
    }

    /// A *replacement* is the same session key reporting materially
    /// different content: a changed item, or a position reset consistent
    /// with the prior item having ended and a new one starting under the
    /// same transport session.
    pub fn is_replacement(&self, snapshot: &NowPlayingSnapshot) -> bool {
        if self.item_id.as_deref() != snapshot.item_id.as_deref() {
            return true;
        }
        self.position_ticks > POSITION_RESET_HIGH_WATERMARK_TICKS
            && snapshot.position_ticks < POSITION_RESET_LOW_WATERMARK_TICKS
            && self.play_duration_seconds > POSITION_RESET_MIN_PLAY_DURATION_SECONDS
    }

    /// Update in place for a non-replacement tick: accrue duration, then
    /// refresh position/pause/transcoding/playstate fields.
    pub fn apply_update(&mut self, snapshot: &NowPlayingSnapshot, now: DateTime<Utc>) {
        self.accrue_duration(now);
        self.position_ticks = snapshot.position_ticks;
        self.runtime_ticks = snapshot.runtime_ticks;
        self.was_paused = self.is_paused;
        self.is_paused = snapshot.is_paused;
        self.play_method = snapshot.play_method.clone();
        self.item_name = snapshot.item_name.clone();
        self.client_name = snapshot.client_name.clone();
        self.device_name = snapshot.device_name.clone();
        self.ip_address = snapshot.ip_address.clone();
        self.last_update_time = now;
        self.last_raw_snapshot = serde_json::to_value(snapshot).unwrap_or(serde_json::json!({}));
    }

    /// Accrue watch duration for this tick only while the session was *not*
    /// paused on the previous tick; a pause→play transition starts accruing
    /// on the *following* tick. `lastUpdateTime` must still be bumped by the
    /// caller regardless.
    fn accrue_duration(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_update_time).num_seconds().max(0);
        if !self.was_paused {
            self.play_duration_seconds += elapsed;
        }
    }

    pub fn is_transcoded(&self) -> bool {
        !matches!(self.play_method.as_str(), "DirectPlay" | "DirectStream")
    }

    fn final_duration(&self, now: DateTime<Utc>) -> i64 {
        let tail = if !self.is_paused {
            (now - self.last_update_time).num_seconds().max(0)
        } else {
            0
        };
        self.play_duration_seconds + tail
    }

    pub fn percent_complete(&self) -> f64 {
        if self.runtime_ticks > 0 {
            (self.position_ticks as f64 / self.runtime_ticks as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Build the finalized `PlaybackSession` row, or `None` if the final
    /// duration doesn't clear the 1-second floor (a session that blipped in
    /// and out within one tick leaves no history row).
    pub fn finalize(&self, now: DateTime<Utc>) -> Option<PlaybackSession> {
        let final_duration = self.final_duration(now);
        if final_duration <= FINALIZE_MIN_DURATION_SECONDS {
            return None;
        }

        let completed = self.percent_complete() > COMPLETED_PERCENT_THRESHOLD;

        let id = match &self.upstream_session_id {
            Some(upstream_id) => PlaybackSession::id_for_upstream(self.server_id, upstream_id, self.start_time),
            None => PlaybackSession::id_for_tracked(self.server_id, &self.session_key, self.start_time),
        };

        Some(PlaybackSession {
            id,
            server_id: self.server_id,
            user_id: self.local_user_id,
            upstream_session_id: self.upstream_session_id.clone(),
            session_key: Some(self.session_key.clone()),
            start_time: self.start_time,
            end_time: Some(now),
            duration_seconds: final_duration,
            media_title: self.item_name.clone(),
            client_name: self.client_name.clone(),
            ip_address: self.ip_address.clone(),
            completed,
            is_transcoded: self.is_transcoded(),
            raw_data: Some(self.last_raw_snapshot.clone()),
        })
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        if self.is_paused {
            SessionLifecycle::ActivePaused
        } else {
            SessionLifecycle::ActivePlaying
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(position_ticks: i64, runtime_ticks: i64, is_paused: bool) -> NowPlayingSnapshot {
        NowPlayingSnapshot {
            upstream_session_id: Some("abc".into()),
            upstream_user_id: Some("u1".into()),
            device_id: Some("dev1".into()),
            series_id: None,
            item_id: Some("item1".into()),
            item_type: Some("Episode".into()),
            provider_ids: vec![],
            item_name: Some("Pilot".into()),
            client_name: Some("Web Client".into()),
            device_name: Some("Chrome".into()),
            ip_address: Some("1.2.3.4".into()),
            position_ticks,
            runtime_ticks,
            is_paused,
            play_method: "DirectPlay".into(),
        }
    }

    #[test]
    fn session_key_prefers_upstream_id() {
        let snap = snapshot(0, 1000, false);
        assert_eq!(snap.session_key(), "sid:abc");
    }

    #[test]
    fn session_key_falls_back_to_composite_key() {
        let mut snap = snapshot(0, 1000, false);
        snap.upstream_session_id = None;
        assert_eq!(snap.session_key(), "u1|dev1||item1");
    }

    #[test]
    fn trailer_and_preroll_are_filtered() {
        let mut snap = snapshot(0, 1000, false);
        snap.item_type = Some("Trailer".into());
        assert!(snap.is_trailer_or_preroll());

        let mut snap2 = snapshot(0, 1000, false);
        snap2.item_type = Some("Movie".into());
        snap2.provider_ids = vec!["prerolls.video".into()];
        assert!(snap2.is_trailer_or_preroll());
    }

    #[test]
    fn accrual_only_happens_while_previously_playing() {
        let now = Utc::now();
        let mut tracked = TrackedSession::new(1, &snapshot(0, 1_000_000, false), now);
        let tick2 = now + chrono::Duration::seconds(10);
        tracked.apply_update(&snapshot(100, 1_000_000, false), tick2);
        assert_eq!(tracked.play_duration_seconds, 10);

        // next tick reported paused; no accrual happened yet for this tick
        // since was_paused reflects state *before* this update.
        let tick3 = tick2 + chrono::Duration::seconds(10);
        tracked.apply_update(&snapshot(100, 1_000_000, true), tick3);
        assert_eq!(tracked.play_duration_seconds, 20);

        // now paused; next tick should not accrue.
        let tick4 = tick3 + chrono::Duration::seconds(10);
        tracked.apply_update(&snapshot(100, 1_000_000, true), tick4);
        assert_eq!(tracked.play_duration_seconds, 20);
    }

    #[test]
    fn position_reset_after_long_play_is_a_replacement() {
        let now = Utc::now();
        let mut tracked = TrackedSession::new(1, &snapshot(700_000_000, 1_000_000_000, false), now);
        tracked.play_duration_seconds = 60;
        let next = snapshot(50_000_000, 1_000_000_000, false);
        assert!(tracked.is_replacement(&next));
    }

    #[test]
    fn item_change_is_always_a_replacement() {
        let now = Utc::now();
        let tracked = TrackedSession::new(1, &snapshot(0, 1_000_000, false), now);
        let mut next = snapshot(0, 1_000_000, false);
        next.item_id = Some("other-item".into());
        assert!(tracked.is_replacement(&next));
    }

    #[test]
    fn finalize_below_one_second_produces_no_row() {
        let now = Utc::now();
        let tracked = TrackedSession::new(1, &snapshot(0, 1_000_000, false), now);
        assert!(tracked.finalize(now).is_none());
    }

    #[test]
    fn finalize_computes_percent_complete_and_completed_flag() {
        let now = Utc::now();
        let mut tracked = TrackedSession::new(1, &snapshot(950_000_000, 1_000_000_000, false), now);
        tracked.play_duration_seconds = 300;
        let later = now + chrono::Duration::seconds(5);
        let session = tracked.finalize(later).unwrap();
        assert_eq!(session.duration_seconds, 305);
        assert!(tracked.percent_complete() > 90.0);
        assert!(session.completed);
        assert!(!session.is_transcoded);
        assert!(session.raw_data.is_some());
    }

    #[test]
    fn is_transcoded_is_false_only_for_direct_play_or_stream() {
        let now = Utc::now();
        let mut tracked = TrackedSession::new(1, &snapshot(0, 1000, false), now);
        assert!(!tracked.is_transcoded());
        tracked.play_method = "Transcode".into();
        assert!(tracked.is_transcoded());
    }
}
