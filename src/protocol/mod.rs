//! Backend protocol: typed events and their wire form.

pub mod events;
pub mod wire;

pub use events::{
    BranchLatest, Chunk, DeleteOk, EditMessage, EditOk, End, Envelope, EventKind, Failure,
    InboundEvent, Intent, NodeRequest, OutboundEvent, PlaceholderCreate, RetryAssistantOk,
    RetryUserOk, RetryUserOutcome, Saved, SendMessage, SendOk, StreamFailure, SwitchBranch,
    SwitchOk,
};
pub use wire::{encode_outbound, inbound_from_value, parse_inbound};
