//! Client for the upstream media server HTTP API. Only the request/response
//! contracts this crate consumes are modeled here: system info, the live
//! sessions list, and the activity log (spec §6).

pub mod fake;
pub mod http;
pub mod types;

pub use fake::FakeUmsClient;
pub use http::HttpUmsClient;
pub use types::{ActivityEntry, NowPlayingEntry, SystemInfo};

use async_trait::async_trait;

#[async_trait]
pub trait UmsClient: Send + Sync {
    async fn system_info(&self) -> anyhow::Result<SystemInfo>;
    async fn sessions(&self) -> anyhow::Result<Vec<NowPlayingEntry>>;
    async fn activities(&self, start_index: i64, limit: i64) -> anyhow::Result<Vec<ActivityEntry>>;
}
