//! Core configuration, error and identifier types.

pub mod applied;
pub mod config;
pub mod errors;
pub mod ids;

pub use applied::{Applied, IgnoreReason};
pub use config::{BridgeConfig, PlaybackConfig, SyncConfig};
pub use errors::{SyncError, SyncResult};
pub use ids::{ConversationFile, NodeId, Tag};
