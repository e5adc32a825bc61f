//! Conversation tree mirror: message nodes, branch order, and the active path.

pub mod node;
pub mod store;

pub use node::{MessageNode, Role};
pub use store::ConversationTree;
