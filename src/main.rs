//! Binary entrypoint for the chat-sync replay tool.

use std::process::ExitCode;

use halldyll_chat_sync::start_chat_sync;

/// Replay a JSON-lines event script and log the resulting conversation.
fn main() -> ExitCode {
    start_chat_sync::run()
}
