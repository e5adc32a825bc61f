//! Wire encoding and boundary validation.
//!
//! Raw frames are parsed into [`InboundEvent`] here and checked for the
//! semantic rules serde cannot express. Anything that fails is reported as
//! `SyncError::Protocol` and never reaches the stores.

use serde_json::Value;

use crate::core::errors::{SyncError, SyncResult};
use crate::protocol::events::{BranchLatest, InboundEvent, OutboundEvent, RetryUserOutcome};

/// Parse and validate one inbound frame.
///
/// # Errors
/// Returns `SyncError::Protocol` if the frame is not a known event or its
/// payload violates a protocol rule.
pub fn parse_inbound(frame: &str) -> SyncResult<InboundEvent> {
    let event: InboundEvent =
        serde_json::from_str(frame).map_err(|e| SyncError::Protocol(e.to_string()))?;
    validate(&event)?;
    Ok(event)
}

/// Parse and validate an already-decoded JSON value.
///
/// # Errors
/// Returns `SyncError::Protocol` on unknown events or invalid payloads.
pub fn inbound_from_value(value: Value) -> SyncResult<InboundEvent> {
    let event: InboundEvent =
        serde_json::from_value(value).map_err(|e| SyncError::Protocol(e.to_string()))?;
    validate(&event)?;
    Ok(event)
}

/// Encode a request for the transport.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_outbound(event: &OutboundEvent) -> SyncResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Check rules that the type system does not capture.
///
/// # Errors
/// Returns `SyncError::Protocol` describing the first violation.
pub fn validate(event: &InboundEvent) -> SyncResult<()> {
    if event.tag().as_str().is_empty() {
        return Err(SyncError::Protocol("empty tag".to_string()));
    }

    match event {
        InboundEvent::SendMessageOk(p) => validate_latest_opt(p.latest.as_ref()),
        InboundEvent::EditMessageOk(p) => validate_latest_opt(p.latest.as_ref()),
        InboundEvent::RetryAssistantOk(p) => validate_latest(&p.latest),
        InboundEvent::RetryUserOk(p) => match &p.outcome {
            RetryUserOutcome::RetryAssistant { latest } => validate_latest(latest),
            RetryUserOutcome::NewPlaceholder { latest } => validate_latest_opt(latest.as_ref()),
        },
        InboundEvent::SwitchBranchOk(p) => {
            validate_latest(&p.latest)?;
            if !p.active_path.contains(&p.latest.node_id) {
                return Err(SyncError::Protocol(format!(
                    "switch result path does not contain {}",
                    p.latest.node_id
                )));
            }
            Ok(())
        }
        InboundEvent::DeleteBranchOk(p) => {
            validate_latest_opt(p.latest.as_ref())?;
            if p.active_path.contains(&p.deleted_id) {
                return Err(SyncError::Protocol(format!(
                    "delete result path still contains {}",
                    p.deleted_id
                )));
            }
            Ok(())
        }
        InboundEvent::PlaceholderCreate(p) => {
            if p.temp_node_id.as_str().is_empty() {
                return Err(SyncError::Protocol("placeholder without node id".to_string()));
            }
            Ok(())
        }
        InboundEvent::Saved(p) => {
            if p.node_id.as_str().is_empty() {
                return Err(SyncError::Protocol("saved without node id".to_string()));
            }
            Ok(())
        }
        InboundEvent::SendMessageFail(_)
        | InboundEvent::EditMessageFail(_)
        | InboundEvent::RetryAssistantFail(_)
        | InboundEvent::RetryUserFail(_)
        | InboundEvent::SwitchBranchFail(_)
        | InboundEvent::DeleteBranchFail(_)
        | InboundEvent::Chunk(_)
        | InboundEvent::Error(_)
        | InboundEvent::End(_) => Ok(()),
    }
}

fn validate_latest_opt(latest: Option<&BranchLatest>) -> SyncResult<()> {
    latest.map_or(Ok(()), validate_latest)
}

fn validate_latest(latest: &BranchLatest) -> SyncResult<()> {
    if latest.sibling_count == 0
        || latest.current_index == 0
        || latest.current_index > latest.sibling_count
    {
        return Err(SyncError::Protocol(format!(
            "branch position {}/{} for {} is out of range",
            latest.current_index, latest.sibling_count, latest.node_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{NodeId, Tag};
    use crate::protocol::events::{Envelope, EventKind, Intent, NodeRequest};

    #[test]
    fn test_parse_retry_assistant_ok() {
        let frame = r#"{
            "event": "RETRY_ASSISTANT_OK",
            "payload": {
                "conversationFile": "chat_1.jsonl",
                "tag": "retry_ass_1",
                "latest": {"node_id": "a2", "currentIndex": 2, "siblingCount": 2}
            }
        }"#;
        let event = parse_inbound(frame).unwrap();
        assert_eq!(event.kind(), EventKind::RetryAssistantOk);
        assert_eq!(event.tag(), &Tag::from("retry_ass_1"));
        assert_eq!(event.settles(), Some((Intent::RetryAssistant, true)));
        let InboundEvent::RetryAssistantOk(ok) = event else {
            panic!("wrong variant");
        };
        assert_eq!(ok.latest.current_index, 2);
        assert!(ok.nodes.is_empty());
    }

    #[test]
    fn test_parse_retry_user_discriminator() {
        let frame = r#"{"event":"RETRY_USER_OK","payload":{"conversationFile":"c","tag":"t",
            "outcome":{"action":"new_placeholder"}}}"#;
        let InboundEvent::RetryUserOk(ok) = parse_inbound(frame).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(ok.outcome, RetryUserOutcome::NewPlaceholder { latest: None });
    }

    #[test]
    fn test_stream_events_have_no_conversation() {
        let event = parse_inbound(r#"{"event":"CHUNK","payload":{"tag":"t","text":"Hel"}}"#).unwrap();
        assert!(event.conversation_file().is_none());
        assert!(event.settles().is_none());
    }

    #[test]
    fn test_rejects_out_of_range_position() {
        let frame = r#"{"event":"SWITCH_BRANCH_OK","payload":{"conversationFile":"c","tag":"t",
            "latest":{"node_id":"a1","currentIndex":3,"siblingCount":2},"active_path":["a1"]}}"#;
        assert!(matches!(parse_inbound(frame), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_rejects_unknown_event() {
        let err = parse_inbound(r#"{"event":"NOPE","payload":{}}"#).unwrap_err();
        assert!(err.is_defect());
    }

    #[test]
    fn test_rejects_delete_path_containing_deleted_node() {
        let frame = r#"{"event":"DELETE_BRANCH_OK","payload":{"conversationFile":"c","tag":"t",
            "deleted_id":"a1","active_path":["u1","a1"]}}"#;
        assert!(parse_inbound(frame).is_err());
    }

    #[test]
    fn test_encode_outbound_shape() {
        let event = OutboundEvent::DeleteBranch(NodeRequest {
            envelope: Envelope {
                conversation_file: "chat_1.jsonl".into(),
                tag: Tag::from("delete_1"),
            },
            node_id: NodeId::from("a1"),
        });
        let value: Value = serde_json::from_str(&encode_outbound(&event).unwrap()).unwrap();
        assert_eq!(value["event"], "DELETE_BRANCH");
        assert_eq!(value["payload"]["conversationFile"], "chat_1.jsonl");
        assert_eq!(value["payload"]["tag"], "delete_1");
        assert_eq!(value["payload"]["node_id"], "a1");
    }
}
