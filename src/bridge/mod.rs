//! Command bridge: tag correlation over the asynchronous event bus.

pub mod command_bridge;
pub mod pending;

pub use command_bridge::{CommandBridge, EventSink, Listener, Request, Subscription};
pub use pending::{OperationState, PendingOperation, PendingTable};
