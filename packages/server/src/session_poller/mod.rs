//! SessionPoller: the long-lived tick loop that reconstructs playback
//! sessions and tails each server's activity log (spec §4.4, §4.5).

pub mod activity_ingestor;
#[allow(clippy::module_inception)]
pub mod poller;
pub mod tracked_session;

pub use activity_ingestor::ActivityIngestor;
pub use poller::{PollerConfig, PollerStatus, SessionPoller};
pub use tracked_session::{NowPlayingSnapshot, TrackedSession};
