use async_trait::async_trait;
use std::sync::Mutex;

use super::types::{ActivityEntry, NowPlayingEntry, SystemInfo};
use super::UmsClient;

/// In-memory UMS double for tests: returns fixed sessions/activities and can
/// be made to fail on demand to exercise backoff.
#[derive(Default)]
pub struct FakeUmsClient {
    pub system_info: Mutex<Option<SystemInfo>>,
    pub sessions: Mutex<Vec<NowPlayingEntry>>,
    pub activities: Mutex<Vec<ActivityEntry>>,
    pub fail_next_sessions_call: Mutex<bool>,
}

impl FakeUmsClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sessions(&self, sessions: Vec<NowPlayingEntry>) {
        *self.sessions.lock().unwrap() = sessions;
    }

    pub fn set_activities(&self, activities: Vec<ActivityEntry>) {
        *self.activities.lock().unwrap() = activities;
    }

    pub fn fail_next_sessions_call(&self) {
        *self.fail_next_sessions_call.lock().unwrap() = true;
    }
}

#[async_trait]
impl UmsClient for FakeUmsClient {
    async fn system_info(&self) -> anyhow::Result<SystemInfo> {
        self.system_info
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("FakeUmsClient: no system info configured"))
    }

    async fn sessions(&self) -> anyhow::Result<Vec<NowPlayingEntry>> {
        let mut should_fail = self.fail_next_sessions_call.lock().unwrap();
        if *should_fail {
            *should_fail = false;
            anyhow::bail!("FakeUmsClient: simulated sessions failure");
        }
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn activities(&self, start_index: i64, limit: i64) -> anyhow::Result<Vec<ActivityEntry>> {
        let all = self.activities.lock().unwrap();
        let start = start_index.max(0) as usize;
        Ok(all.iter().skip(start).take(limit as usize).cloned().collect())
    }
}
