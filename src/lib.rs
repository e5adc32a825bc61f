//! Client-side sync engine for branching chat conversations.
//!
//! Mirrors a backend-owned conversation tree, correlates tagged requests
//! with their results, navigates sibling branches, and plays streamed
//! assistant text back at a backlog-adaptive rate.

// Strict lint set: warnings are errors and public items are documented.
#![deny(warnings)]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(dead_code)]
#![deny(non_camel_case_types)]
#![deny(unused_imports)]
#![deny(unused_variables)]
#![deny(unused_must_use)]
#![deny(non_snake_case)]
#![deny(non_upper_case_globals)]
#![deny(nonstandard_style)]
#![forbid(unsafe_op_in_unsafe_fn)]
// Clippy
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::missing_const_for_fn)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::module_inception)]
#![deny(clippy::redundant_clone)]
#![deny(clippy::shadow_unrelated)]
#![deny(clippy::too_many_arguments)]
#![deny(clippy::cognitive_complexity)]
#![deny(overflowing_literals)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::too_many_lines
    )
)]

/// Request/result correlation over the event bus.
pub mod bridge;
/// Configuration, errors, identifiers, and apply-or-ignore results.
pub mod core;
/// Single-writer conversation state and its tokio driver.
#[allow(clippy::module_name_repetitions, clippy::significant_drop_tightening)]
pub mod engine;
/// Sibling indicators and branch operations.
#[allow(clippy::module_name_repetitions)]
pub mod navigator;
/// Typed backend events and their wire form.
pub mod protocol;
/// Entry helpers for the replay binary.
pub mod start_chat_sync;
/// Streaming sessions and typewriter playback.
#[allow(clippy::module_name_repetitions)]
pub mod stream;
/// Conversation tree mirror.
pub mod tree;
/// Render-ready projection.
pub mod view;

pub use crate::core::{Applied, IgnoreReason, SyncConfig, SyncError, SyncResult};
pub use crate::engine::{ConversationSync, SyncEngine, SyncHandle, UserIntent};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
