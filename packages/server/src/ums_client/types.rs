//! Wire types for the UMS HTTP surface this crate consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub id: String,
    pub version: String,
    pub product_name: String,
    pub operating_system: String,
    pub startup_wizard_completed: bool,
    pub local_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NowPlayingItem {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub series_id: Option<String>,
    pub series_name: Option<String>,
    pub run_time_ticks: Option<i64>,
    #[serde(default)]
    pub provider_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayState {
    pub is_paused: bool,
    pub position_ticks: Option<i64>,
    pub play_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowPlayingEntry {
    pub id: String,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub client: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub remote_end_point: Option<String>,
    pub is_active: bool,
    pub now_playing_item: Option<NowPlayingItem>,
    pub play_state: Option<PlayState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub name: String,
    pub short_overview: Option<String>,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub date: DateTime<Utc>,
    pub severity: String,
    pub user_id: Option<String>,
    pub item_id: Option<String>,
}
