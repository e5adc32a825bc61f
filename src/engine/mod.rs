//! Sync engine: the single-writer conversation state and the task that
//! drives it.

pub mod actor;
pub mod conversation;


pub use actor::{SyncEngine, SyncHandle, UserIntent};
pub use conversation::ConversationSync;
