//! Streaming turns: session buffers, typewriter playback, and reconciliation.

pub mod playback;
pub mod reconciler;
pub mod session;

pub use playback::{chars_to_release, release_rate};
pub use reconciler::{FinishedStream, StreamReconciler, TickOutcome};
pub use session::StreamSession;
