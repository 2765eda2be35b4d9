//! The long-lived, in-process tick loop: polls every server's live sessions,
//! reconstructs playback sessions across ticks, and tails each server's
//! activity log. Not a queue job — its correctness depends on in-memory
//! state that must survive individual ticks (spec §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::active_sessions::ActiveSession;
use crate::db::users::User;
use crate::scheduler::policy::JobPolicy;
use crate::session_poller::activity_ingestor::ActivityIngestor;
use crate::session_poller::tracked_session::{NowPlayingSnapshot, TrackedSession};
use crate::ums_client::{NowPlayingEntry, PlayState, UmsClient};

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(15);
const BACKOFF_BASE_SECS: f64 = 10.0;
const BACKOFF_GROWTH_FACTOR: f64 = 1.5;
const BACKOFF_CAP_SECS: f64 = 120.0;
const UNHEALTHY_CONSECUTIVE_FAILURES: u32 = 10;
const UNHEALTHY_STALE_SUCCESS_MINUTES: i64 = 5;
const SESSION_POLLING_JOB_KEY: &str = "session-polling";

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub tick_interval: Duration,
    pub server_timeout: Duration,
    pub server_retries: u32,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
struct BackoffState {
    next_allowed_at: DateTime<Utc>,
    current_delay_secs: f64,
}

#[derive(Debug, Default)]
pub struct PollerStatus {
    pub total_ticks: AtomicI64,
    pub successful_ticks: AtomicI64,
    pub failed_ticks: AtomicI64,
    pub consecutive_failures: AtomicU32,
    pub last_success_at: Mutex<Option<DateTime<Utc>>>,
    pub last_cycle_duration_ms: AtomicI64,
    pub loop_running: AtomicBool,
}

impl PollerStatus {
    pub fn success_rate(&self) -> f64 {
        let total = self.total_ticks.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.successful_ticks.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn is_healthy(&self) -> bool {
        if !self.loop_running.load(Ordering::Relaxed) {
            return false;
        }
        if self.consecutive_failures.load(Ordering::Relaxed) >= UNHEALTHY_CONSECUTIVE_FAILURES {
            return false;
        }
        match *self.last_success_at.lock().unwrap() {
            None => true,
            Some(last) => Utc::now() - last < chrono::Duration::minutes(UNHEALTHY_STALE_SUCCESS_MINUTES),
        }
    }
}

pub struct SessionPoller {
    pool: PgPool,
    policy: Arc<dyn JobPolicy>,
    config: PollerConfig,
    clients: Mutex<HashMap<i64, Arc<dyn UmsClient>>>,
    tracked: Mutex<HashMap<i64, HashMap<String, TrackedSession>>>,
    backoff: Mutex<HashMap<i64, BackoffState>>,
    ingestor: ActivityIngestor,
    pub status: Arc<PollerStatus>,
}

impl SessionPoller {
    pub fn new(pool: PgPool, policy: Arc<dyn JobPolicy>, config: PollerConfig) -> Self {
        let ingestor = ActivityIngestor::new(pool.clone());
        Self {
            pool,
            policy,
            config,
            clients: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            ingestor,
            status: Arc::new(PollerStatus::default()),
        }
    }

    pub fn register_client(&self, server_id: i64, client: Arc<dyn UmsClient>) {
        self.clients.lock().unwrap().insert(server_id, client);
    }

    /// Reload open sessions for `server_id` from `active_sessions` into the
    /// in-memory map, so an at-most-a-few-seconds crash loses no watch time.
    pub async fn restore(&self, server_id: i64) -> anyhow::Result<()> {
        let rows = ActiveSession::find_all_for_server(server_id, &self.pool).await?;
        let mut tracked = self.tracked.lock().unwrap();
        let map = tracked.entry(server_id).or_default();
        for row in rows {
            if let Ok(session) = serde_json::from_value::<TrackedSession>(row.payload) {
                map.insert(row.session_key, session);
            }
        }
        Ok(())
    }

    fn is_in_backoff(&self, server_id: i64) -> bool {
        self.backoff
            .lock()
            .unwrap()
            .get(&server_id)
            .map(|b| b.next_allowed_at > Utc::now())
            .unwrap_or(false)
    }

    fn record_failure(&self, server_id: i64) {
        let mut backoff = self.backoff.lock().unwrap();
        let entry = backoff.entry(server_id).or_insert(BackoffState {
            next_allowed_at: Utc::now(),
            current_delay_secs: BACKOFF_BASE_SECS,
        });
        entry.next_allowed_at = Utc::now() + chrono::Duration::milliseconds((entry.current_delay_secs * 1000.0) as i64);
        entry.current_delay_secs = (entry.current_delay_secs * BACKOFF_GROWTH_FACTOR).min(BACKOFF_CAP_SECS);
    }

    fn record_recovery(&self, server_id: i64) {
        let mut backoff = self.backoff.lock().unwrap();
        if backoff.remove(&server_id).is_some() {
            info!(server_id, "session poller: server recovered from backoff");
        }
    }

    pub fn servers_in_backoff(&self) -> usize {
        let now = Utc::now();
        self.backoff.lock().unwrap().values().filter(|b| b.next_allowed_at > now).count()
    }

    /// Run the tick loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, server_ids: Vec<i64>, shutdown: CancellationToken) {
        self.status.loop_running.store(true, Ordering::Relaxed);

        for server_id in &server_ids {
            if let Err(err) = self.restore(*server_id).await {
                warn!(server_id, error = %err, "session poller: failed to restore active sessions");
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
            if shutdown.is_cancelled() {
                break;
            }

            let tick_signal = CancellationToken::new();
            let watchdog_signal = tick_signal.clone();
            let watchdog = tokio::spawn(async move {
                tokio::time::sleep(WATCHDOG_TIMEOUT).await;
                watchdog_signal.cancel();
            });

            let started = std::time::Instant::now();
            // A stop request mid-tick gets at most STOP_GRACE_PERIOD to
            // unwind cooperatively before its signal is forced like the
            // watchdog's.
            let shutdown_during_tick = shutdown.clone();
            let tick_signal_for_stop = tick_signal.clone();
            let stop_watchdog = tokio::spawn(async move {
                shutdown_during_tick.cancelled().await;
                tokio::time::sleep(STOP_GRACE_PERIOD).await;
                tick_signal_for_stop.cancel();
            });
            self.run_tick(&server_ids, &tick_signal).await;
            stop_watchdog.abort();
            watchdog.abort();
            self.status
                .last_cycle_duration_ms
                .store(started.elapsed().as_millis() as i64, Ordering::Relaxed);
        }

        self.shutdown_finalize(&server_ids).await;
        self.status.loop_running.store(false, Ordering::Relaxed);
    }

    async fn run_tick(&self, server_ids: &[i64], tick_signal: &CancellationToken) {
        self.status.total_ticks.fetch_add(1, Ordering::Relaxed);

        let due: Vec<i64> = server_ids
            .iter()
            .copied()
            .filter(|id| self.policy.is_enabled(*id, SESSION_POLLING_JOB_KEY) && !self.is_in_backoff(*id))
            .collect();

        let results: Vec<bool> = stream::iter(due)
            .map(|server_id| {
                let tick_signal = tick_signal.clone();
                async move { self.poll_server(server_id, tick_signal).await }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        if results.iter().all(|ok| *ok) && !results.is_empty() {
            self.status.successful_ticks.fetch_add(1, Ordering::Relaxed);
            self.status.consecutive_failures.store(0, Ordering::Relaxed);
            *self.status.last_success_at.lock().unwrap() = Some(Utc::now());
        } else if results.iter().any(|ok| !*ok) {
            self.status.failed_ticks.fetch_add(1, Ordering::Relaxed);
            self.status.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One server's poll: fetch sessions, reconcile, persist, tail activity
    /// log. Returns `false` on a genuine failure (not cancellation).
    async fn poll_server(&self, server_id: i64, tick_signal: CancellationToken) -> bool {
        let client = match self.clients.lock().unwrap().get(&server_id).cloned() {
            Some(c) => c,
            None => return true,
        };

        let sessions = tokio::select! {
            _ = tick_signal.cancelled() => {
                info!(server_id, "session poller: poll cancelled by tick signal");
                return true;
            }
            result = tokio::time::timeout(self.config.server_timeout, client.sessions()) => result,
        };

        let sessions = match sessions {
            Ok(Ok(sessions)) => sessions,
            Ok(Err(err)) => {
                error!(server_id, error = %err, "session poller: poll failed");
                self.record_failure(server_id);
                return false;
            }
            Err(_) => {
                error!(server_id, "session poller: poll timed out");
                self.record_failure(server_id);
                return false;
            }
        };

        self.record_recovery(server_id);
        self.reconcile(server_id, sessions, Utc::now()).await;

        if let Err(err) = self.ingestor.ingest(server_id, &client).await {
            warn!(server_id, error = %err, "session poller: activity ingest failed");
        }

        true
    }

    fn to_snapshot(entry: &NowPlayingEntry) -> Option<NowPlayingSnapshot> {
        let item = entry.now_playing_item.as_ref()?;
        let play_state = entry.play_state.clone().unwrap_or(PlayState::default());
        Some(NowPlayingSnapshot {
            upstream_session_id: Some(entry.id.clone()),
            upstream_user_id: entry.user_id.clone(),
            device_id: entry.device_id.clone(),
            series_id: item.series_id.clone(),
            item_id: item.id.clone(),
            item_type: item.item_type.clone(),
            provider_ids: item.provider_ids.clone(),
            item_name: item.name.clone(),
            client_name: entry.client.clone(),
            device_name: entry.device_name.clone(),
            ip_address: entry.remote_end_point.clone(),
            position_ticks: play_state.position_ticks.unwrap_or(0),
            runtime_ticks: item.run_time_ticks.unwrap_or(0),
            is_paused: play_state.is_paused,
            play_method: play_state.play_method.unwrap_or_else(|| "DirectPlay".to_string()),
        })
    }

    async fn reconcile(&self, server_id: i64, entries: Vec<NowPlayingEntry>, now: DateTime<Utc>) {
        let snapshots: Vec<NowPlayingSnapshot> = entries
            .iter()
            .filter(|e| e.is_active)
            .filter_map(Self::to_snapshot)
            .filter(|s| !s.is_trailer_or_preroll())
            .collect();

        let incoming_keys: std::collections::HashSet<String> = snapshots.iter().map(|s| s.session_key()).collect();

        let mut to_finalize: Vec<TrackedSession> = Vec::new();
        let mut to_persist: Vec<TrackedSession> = Vec::new();

        {
            let mut tracked = self.tracked.lock().unwrap();
            let map = tracked.entry(server_id).or_default();

            // Ended: present in map but not in this tick's snapshots.
            let ended_keys: Vec<String> = map.keys().filter(|k| !incoming_keys.contains(*k)).cloned().collect();
            for key in ended_keys {
                if let Some(session) = map.remove(&key) {
                    to_finalize.push(session);
                }
            }

            for snapshot in &snapshots {
                let key = snapshot.session_key();
                match map.remove(&key) {
                    None => {
                        let fresh = TrackedSession::new(server_id, snapshot, now);
                        to_persist.push(fresh.clone());
                        map.insert(key, fresh);
                    }
                    Some(existing) => {
                        if existing.is_replacement(snapshot) {
                            to_finalize.push(existing);
                            let fresh = TrackedSession::new(server_id, snapshot, now);
                            to_persist.push(fresh.clone());
                            map.insert(key, fresh);
                        } else {
                            let mut updated = existing;
                            updated.apply_update(snapshot, now);
                            to_persist.push(updated.clone());
                            map.insert(key, updated);
                        }
                    }
                }
            }
        }

        for session in to_finalize {
            self.finalize_session(session, now).await;
        }

        self.persist_open_sessions(server_id, &to_persist, now).await;
    }

    async fn resolve_local_user(&self, server_id: i64, upstream_user_id: Option<&str>) -> Option<i64> {
        let upstream_user_id = upstream_user_id?;
        User::find_by_upstream_id(server_id, upstream_user_id, &self.pool)
            .await
            .ok()
            .flatten()
            .map(|u| u.id)
    }

    async fn finalize_session(&self, mut session: TrackedSession, now: DateTime<Utc>) {
        session.local_user_id = self
            .resolve_local_user(session.server_id, session.upstream_user_id.as_deref())
            .await;

        let Some(row) = session.finalize(now) else {
            return;
        };

        if let Err(err) = crate::db::sessions::PlaybackSession::insert_if_absent(&row, &self.pool).await {
            error!(
                server_id = session.server_id,
                session_key = %session.session_key,
                error = %err,
                "session poller: failed to persist finalized session"
            );
        }

        if let Err(err) = ActiveSession::remove(session.server_id, &session.session_key, &self.pool).await {
            warn!(server_id = session.server_id, error = %err, "session poller: failed to clear active_sessions row");
        }
    }

    async fn persist_open_sessions(&self, server_id: i64, sessions: &[TrackedSession], now: DateTime<Utc>) {
        for session in sessions {
            if let Err(err) = ActiveSession::upsert(server_id, &session.session_key, &session.to_payload(), now, &self.pool).await {
                error!(server_id, session_key = %session.session_key, error = %err, "session poller: failed to persist open session");
            }
        }
    }

    /// Stop flag path: wait up to 15s for the current tick, finalize every
    /// still-open tracked session, delete all active_sessions rows, clear
    /// the map.
    async fn shutdown_finalize(&self, server_ids: &[i64]) {
        let now = Utc::now();
        let remaining: Vec<TrackedSession> = {
            let mut tracked = self.tracked.lock().unwrap();
            tracked.values_mut().flat_map(|m| m.drain().map(|(_, s)| s)).collect()
        };

        for session in remaining {
            self.finalize_session(session, now).await;
        }

        for server_id in server_ids {
            if let Err(err) = sqlx::query("DELETE FROM active_sessions WHERE server_id = $1")
                .bind(server_id)
                .execute(&self.pool)
                .await
            {
                warn!(server_id, error = %err, "session poller: failed to clear active_sessions on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_growth_is_capped() {
        let mut delay = BACKOFF_BASE_SECS;
        for _ in 0..20 {
            delay = (delay * BACKOFF_GROWTH_FACTOR).min(BACKOFF_CAP_SECS);
        }
        assert_eq!(delay, BACKOFF_CAP_SECS);
    }

    #[test]
    fn status_healthy_requires_running_and_low_failures() {
        let status = PollerStatus::default();
        assert!(!status.is_healthy());
        status.loop_running.store(true, Ordering::Relaxed);
        assert!(status.is_healthy());
        status.consecutive_failures.store(10, Ordering::Relaxed);
        assert!(!status.is_healthy());
    }
}
