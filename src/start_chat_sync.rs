//! Replay runner for the `chat-sync-replay` binary.
//!
//! Reads a JSON-lines script and feeds it through a [`ConversationSync`] with
//! deterministic playback ticks. Each line is one of:
//!
//! - `{"snapshot": {"conversation": "...", "nodes": [...], "active_path": [...]}}`
//! - `{"intent": {"action": "send", "content": "hi"}, "alias": "t1"}`
//! - a backend event `{"event": "CHUNK", "payload": {"tag": "t1", ...}}`
//!
//! Intents get real generated tags; `alias` lets later event payloads refer
//! to that tag by a fixed name. For a send, `<alias>:node` also names the
//! optimistic user node.

use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::config::SyncConfig;
use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::{ConversationFile, NodeId};
use crate::engine::actor::{UserIntent, run_intent};
use crate::engine::conversation::ConversationSync;
use crate::protocol::events::{BranchLatest, OutboundEvent};
use crate::protocol::wire::inbound_from_value;
use crate::tree::node::MessageNode;
use crate::view::projection::ConversationView;

/// Env var naming a JSON config file for the replay.
pub const ENV_CONFIG_PATH: &str = "CHAT_SYNC_CONFIG";

/// Conversation used when the script has no snapshot line.
const DEFAULT_CONVERSATION: &str = "replay.jsonl";

/// Upper bound on playback ticks after one line.
const MAX_DRAIN_TICKS: usize = 100_000;

#[derive(Debug, Deserialize)]
struct Snapshot {
    conversation: ConversationFile,
    #[serde(default)]
    nodes: Vec<MessageNode>,
    #[serde(default)]
    active_path: Vec<NodeId>,
    #[serde(default)]
    positions: Vec<BranchLatest>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptLine {
    Snapshot {
        snapshot: Snapshot,
    },
    Intent {
        intent: UserIntent,
        #[serde(default)]
        alias: Option<String>,
    },
    Event(Value),
}

/// Outcome of a replay.
#[derive(Debug, Default)]
pub struct ReplayReport {
    /// Lines that changed state.
    pub applied: usize,
    /// Lines ignored as stale, duplicate, or foreign.
    pub ignored: usize,
    /// Lines rejected as malformed or invalid.
    pub rejected: usize,
    /// Requests the engine emitted.
    pub requests: Vec<OutboundEvent>,
    /// Final projection.
    pub view: ConversationView,
}

/// Binary entry point.
#[must_use]
pub fn run() -> ExitCode {
    crate::init_tracing();
    info!("chat-sync-replay v{}", env!("CARGO_PKG_VERSION"));

    let Some(script) = std::env::args().nth(1) else {
        error!("usage: chat-sync-replay <script.jsonl>");
        return ExitCode::from(2);
    };

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    match replay_file(&script, &config) {
        Ok(report) => {
            log_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Replay failed: {e}");
            ExitCode::from(exit_status(&e))
        }
    }
}

/// Config from `CHAT_SYNC_CONFIG` if set, else defaults with env overrides.
///
/// # Errors
/// Returns an error if the file cannot be read or the result is invalid.
pub fn load_config() -> SyncResult<SyncConfig> {
    match std::env::var(ENV_CONFIG_PATH) {
        Ok(path) => {
            info!(%path, "loading config file");
            SyncConfig::from_json_file(path)
        }
        Err(_) => SyncConfig::from_env(),
    }
}

/// Replay a script file.
///
/// # Errors
/// Returns an error if the file cannot be read or a snapshot does not fit.
pub fn replay_file(path: impl AsRef<Path>, config: &SyncConfig) -> SyncResult<ReplayReport> {
    let raw = std::fs::read_to_string(path)?;
    replay_lines(raw.lines(), config)
}

/// Replay script lines.
///
/// Bad event lines are counted and skipped; only an invalid snapshot aborts.
///
/// # Errors
/// Returns `InvariantViolation` if a snapshot's path does not fit its nodes.
pub fn replay_lines<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    config: &SyncConfig,
) -> SyncResult<ReplayReport> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = Arc::new(tx);
    let mut sync = ConversationSync::new(
        ConversationFile::from(DEFAULT_CONVERSATION),
        sink.clone(),
        config,
    );
    let mut aliases: HashMap<String, String> = HashMap::new();
    let mut report = ReplayReport::default();

    for (number, line) in lines.into_iter().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed: ScriptLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(line = number + 1, "unreadable line: {e}");
                report.rejected += 1;
                continue;
            }
        };

        match parsed {
            ScriptLine::Snapshot { snapshot } => {
                sync.dispose();
                sync = ConversationSync::new(snapshot.conversation, sink.clone(), config);
                sync.load(snapshot.nodes, snapshot.active_path)?;
                sync.load_positions(&snapshot.positions);
                aliases.clear();
                report.applied += 1;
            }
            ScriptLine::Intent { intent, alias } => {
                let is_send = matches!(intent, UserIntent::Send { .. });
                match run_intent(&mut sync, intent) {
                    Ok(tag) => {
                        debug!(line = number + 1, %tag, "intent issued");
                        if let Some(alias) = alias {
                            if is_send {
                                if let Some(leaf) = sync.tree().active_leaf() {
                                    aliases.insert(format!("{alias}:node"), leaf.to_string());
                                }
                            }
                            aliases.insert(alias, tag.into_inner());
                        }
                        report.applied += 1;
                    }
                    Err(e) => {
                        warn!(line = number + 1, "intent rejected: {e}");
                        report.rejected += 1;
                    }
                }
            }
            ScriptLine::Event(value) => {
                let event = inbound_from_value(resolve_aliases(value, &aliases));
                match event.and_then(|event| sync.handle_event(event)) {
                    Ok(applied) if applied.is_applied() => report.applied += 1,
                    Ok(applied) => {
                        debug!(line = number + 1, reason = ?applied.ignore_reason(), "event ignored");
                        report.ignored += 1;
                    }
                    Err(e) => {
                        warn!(line = number + 1, "event rejected: {e}");
                        report.rejected += 1;
                    }
                }
            }
        }

        drain(&mut sync, config);
        while let Ok(request) = rx.try_recv() {
            report.requests.push(request);
        }
    }

    report.view = sync.snapshot(Instant::now());
    Ok(report)
}

fn resolve_aliases(mut value: Value, aliases: &HashMap<String, String>) -> Value {
    if let Some(payload) = value.get_mut("payload").and_then(Value::as_object_mut) {
        for field in payload.values_mut() {
            let real = field.as_str().and_then(|alias| aliases.get(alias));
            if let Some(real) = real {
                *field = Value::String(real.clone());
            }
        }
    }
    value
}

fn drain(sync: &mut ConversationSync, config: &SyncConfig) {
    let mut ticks = 0;
    while sync.has_backlog() && ticks < MAX_DRAIN_TICKS {
        sync.tick(config.playback.frame_interval);
        ticks += 1;
    }
    if sync.has_backlog() {
        warn!(ticks, "playback did not drain");
    }
}

fn log_report(report: &ReplayReport) {
    info!(
        applied = report.applied,
        ignored = report.ignored,
        rejected = report.rejected,
        requests = report.requests.len(),
        "replay finished"
    );
    for message in &report.view.messages {
        info!(
            role = %message.role,
            node_id = %message.node_id,
            branch = ?message.branch_position.map(|p| (p.current_index, p.sibling_count)),
            error = message.error_message.as_deref().unwrap_or(""),
            "{}",
            message.text
        );
    }
}

/// Process status for a failed replay: 3 for defects, 1 otherwise.
#[must_use]
pub const fn exit_status(err: &SyncError) -> u8 {
    if err.is_defect() { 3 } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
{"snapshot": {"conversation": "chat_1.jsonl", "nodes": [{"id": "root", "role": "system"}], "active_path": ["root"]}}
{"intent": {"action": "send", "content": "hi"}, "alias": "t1"}
{"event": "SEND_MESSAGE_OK", "payload": {"conversationFile": "chat_1.jsonl", "tag": "t1", "client_node_id": "t1:node", "user_node": {"id": "u1", "parent_id": "root", "role": "user", "content": "hi"}}}
{"event": "PLACEHOLDER_CREATE", "payload": {"conversationFile": "chat_1.jsonl", "tag": "t1", "tempNodeId": "a1", "parent_id": "u1"}}
{"event": "CHUNK", "payload": {"tag": "t1", "text": "Hel"}}
{"event": "CHUNK", "payload": {"tag": "t1", "text": "lo world"}}
{"event": "SAVED", "payload": {"tag": "t1", "node_id": "a1_durable"}}
{"event": "END", "payload": {"tag": "t1"}}
{"event": "END", "payload": {"tag": "t1"}}
not json
"#;

    #[test]
    fn test_replay_script() {
        let report = replay_lines(SCRIPT.lines(), &SyncConfig::default()).unwrap();
        assert_eq!(report.applied, 8);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.requests.len(), 1);

        let last = report.view.messages.last().unwrap();
        assert_eq!(last.node_id, NodeId::from("a1_durable"));
        assert_eq!(last.text, "Hello world");
        assert!(!last.is_streaming);
        assert!(report.view.can_send);
        assert_eq!(report.view.messages.len(), 3);
        assert_eq!(report.view.messages[1].node_id, NodeId::from("u1"));
    }

    #[test]
    fn test_alias_resolution_only_touches_known_names() {
        let mut aliases = HashMap::new();
        aliases.insert("t1".to_string(), "send_abc".to_string());

        let known = resolve_aliases(
            serde_json::json!({"event": "END", "payload": {"tag": "t1"}}),
            &aliases,
        );
        assert_eq!(known["payload"]["tag"], "send_abc");

        let unknown = resolve_aliases(
            serde_json::json!({"event": "END", "payload": {"tag": "zz"}}),
            &aliases,
        );
        assert_eq!(unknown["payload"]["tag"], "zz");
    }

    #[test]
    fn test_exit_code_for_defects() {
        assert_eq!(exit_status(&SyncError::Protocol("bad".to_string())), 3);
        assert_eq!(exit_status(&SyncError::TransportClosed), 1);
    }
}
