//! View projection: pure derivation of what to render.

pub mod projection;

pub use projection::{ConversationView, MessageView, ProjectionSource, SendFailure};
