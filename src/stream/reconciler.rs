//! Stream reconciler: placeholder, chunk, save, error and end handling for
//! every streaming turn, plus the single playback loop that drains them.
//!
//! Streaming events are routed by tag. Sessions are keyed by node id so the
//! view can find them, which is why a `SAVED` rename has to move the key.
//!
//! A turn's tag record lives until the turn has both finished and been
//! saved. Retired tags are remembered for the most recent turns only, so
//! very late events for old turns read as unknown rather than retired.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::applied::{Applied, IgnoreReason};
use crate::core::config::PlaybackConfig;
use crate::core::ids::{NodeId, Tag};
use crate::stream::playback::chars_to_release;
use crate::stream::session::StreamSession;

/// Retired tags remembered for rejecting late events.
const RETIRED_TAG_MEMORY: usize = 256;

/// A session that reached a terminal state and was destroyed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedStream {
    /// Node the text belongs to.
    pub node_id: NodeId,
    /// Turn tag.
    pub tag: Tag,
    /// Text to commit as the node's content.
    pub text: String,
    /// Failure message for errored turns.
    pub error: Option<String>,
}

/// Result of one playback tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Characters released across all sessions.
    pub released: usize,
    /// Sessions that drained after `END` during this tick.
    pub finished: Vec<FinishedStream>,
}

/// Owner of every open stream session.
#[derive(Debug)]
pub struct StreamReconciler {
    playback: PlaybackConfig,
    sessions: HashMap<NodeId, StreamSession>,
    turns: HashMap<Tag, NodeId>,
    saved: HashSet<Tag>,
    retired: HashSet<Tag>,
    retired_order: VecDeque<Tag>,
}

impl StreamReconciler {
    /// Create an empty reconciler.
    #[must_use]
    pub fn new(playback: PlaybackConfig) -> Self {
        Self {
            playback,
            sessions: HashMap::new(),
            turns: HashMap::new(),
            saved: HashSet::new(),
            retired: HashSet::new(),
            retired_order: VecDeque::new(),
        }
    }

    /// Start a session for a placeholder node.
    ///
    /// Duplicate placeholder events and events for finished turns are no-ops.
    pub fn open(&mut self, tag: Tag, node_id: NodeId, now: Instant) -> Applied {
        if self.retired.contains(&tag) {
            return Applied::Ignored(IgnoreReason::RetiredTag(tag));
        }
        if self.turns.contains_key(&tag) || self.sessions.contains_key(&node_id) {
            debug!(%tag, %node_id, "duplicate placeholder ignored");
            return Applied::Ignored(IgnoreReason::Duplicate);
        }

        info!(%tag, %node_id, "stream opened");
        self.turns.insert(tag.clone(), node_id.clone());
        self.sessions
            .insert(node_id.clone(), StreamSession::new(node_id, tag, now));
        Applied::done()
    }

    /// Append a chunk to the session for `tag`.
    pub fn push_chunk(&mut self, tag: &Tag, text: &str) -> Applied {
        let session = match self.live_session_mut(tag) {
            Ok(session) => session,
            Err(reason) => {
                debug!(%tag, "chunk ignored");
                return Applied::Ignored(reason);
            }
        };
        if text.is_empty() {
            return Applied::Ignored(IgnoreReason::NoChange);
        }
        session.push(text);
        Applied::done()
    }

    /// Advance playback of every session by `elapsed`.
    ///
    /// Sessions that were ended and are now fully visible are destroyed and
    /// returned so their text can be committed.
    pub fn tick(&mut self, elapsed: Duration) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        for session in self.sessions.values_mut() {
            let backlog = session.backlog();
            if backlog > 0 {
                let count = chars_to_release(&self.playback, backlog, elapsed);
                outcome.released += session.release(count);
            }
        }

        let drained: Vec<NodeId> = self
            .sessions
            .values()
            .filter(|s| s.is_drained())
            .map(|s| s.node_id().clone())
            .collect();
        for node_id in drained {
            if let Some(finished) = self.finish(&node_id) {
                outcome.finished.push(finished);
            }
        }
        outcome
    }

    /// Whether the playback loop has work to do.
    #[must_use]
    pub fn has_backlog(&self) -> bool {
        self.sessions.values().any(|s| s.backlog() > 0)
    }

    /// Mark the turn ended.
    ///
    /// The session is destroyed once its backlog is empty: immediately if it
    /// already is, otherwise by a later [`Self::tick`].
    pub fn end(&mut self, tag: &Tag) -> Applied<Option<FinishedStream>> {
        let session = match self.live_session_mut(tag) {
            Ok(session) => session,
            Err(reason) => return Applied::Ignored(reason),
        };
        session.mark_ended();
        let node_id = session.node_id().clone();
        let drained = session.is_drained();
        self.retire(tag);

        if drained {
            Applied::Applied(self.finish(&node_id))
        } else {
            debug!(%tag, %node_id, "end deferred until backlog drains");
            Applied::Applied(None)
        }
    }

    /// Fail the turn.
    ///
    /// Unplayed text is discarded; what the user already saw is returned for
    /// committing along with the error message.
    pub fn fail(&mut self, tag: &Tag, message: &str) -> Applied<FinishedStream> {
        let node_id = match self.live_session_mut(tag) {
            Ok(session) => session.node_id().clone(),
            Err(reason) => return Applied::Ignored(reason),
        };
        self.retire(tag);

        let Some(session) = self.sessions.remove(&node_id) else {
            return Applied::Ignored(IgnoreReason::UnknownTag(tag.clone()));
        };
        self.prune_if_saved(tag);
        warn!(%tag, %node_id, discarded = session.backlog(), "stream failed: {message}");
        Applied::Applied(FinishedStream {
            node_id,
            tag: tag.clone(),
            text: session.visible_buffer().to_string(),
            error: Some(message.to_string()),
        })
    }

    /// Move a session and its turn record to a durable node id.
    ///
    /// Buffers are preserved untouched. Only called together with the tree
    /// rewrite.
    pub fn rewrite(&mut self, old_id: &NodeId, new_id: &NodeId) -> Applied {
        let mut changed = false;
        if let Some(mut session) = self.sessions.remove(old_id) {
            session.rename(new_id.clone());
            self.sessions.insert(new_id.clone(), session);
            changed = true;
        }
        for node_id in self.turns.values_mut() {
            if node_id == old_id {
                *node_id = new_id.clone();
                changed = true;
            }
        }
        if changed {
            Applied::done()
        } else {
            Applied::Ignored(IgnoreReason::UnknownNode(old_id.clone()))
        }
    }

    /// Record that `SAVED` arrived for a turn.
    ///
    /// The tag record is dropped now if the turn already finished, otherwise
    /// when it does.
    pub fn mark_saved(&mut self, tag: &Tag) {
        let Some(node_id) = self.turns.get(tag) else {
            return;
        };
        if self.sessions.contains_key(node_id) {
            self.saved.insert(tag.clone());
        } else {
            debug!(%tag, "turn record pruned");
            self.turns.remove(tag);
        }
    }

    /// Drop sessions and turn records for nodes that left the tree; their
    /// tags are retired.
    pub fn remove_nodes<'a>(&mut self, ids: impl IntoIterator<Item = &'a NodeId>) -> usize {
        let ids: HashSet<&NodeId> = ids.into_iter().collect();
        let mut removed = 0;
        for id in &ids {
            if let Some(session) = self.sessions.remove(*id) {
                debug!(tag = %session.tag(), node_id = %id, "stream dropped with its node");
                self.retire(session.tag());
                removed += 1;
            }
        }
        let gone: Vec<Tag> = self
            .turns
            .iter()
            .filter(|(_, node_id)| ids.contains(node_id))
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in gone {
            self.turns.remove(&tag);
            self.saved.remove(&tag);
        }
        removed
    }

    /// Whether late events for `tag` are being rejected as retired.
    #[must_use]
    pub fn is_retired(&self, tag: &Tag) -> bool {
        self.retired.contains(tag)
    }

    /// Number of turns whose tag is still routed.
    #[must_use]
    pub fn tracked_turns(&self) -> usize {
        self.turns.len()
    }

    /// Open session for a node.
    #[must_use]
    pub fn session(&self, node_id: &NodeId) -> Option<&StreamSession> {
        self.sessions.get(node_id)
    }

    /// Node a turn streams into, including finished turns.
    #[must_use]
    pub fn node_for_tag(&self, tag: &Tag) -> Option<&NodeId> {
        self.turns.get(tag)
    }

    /// Whether any session is open.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        !self.sessions.is_empty()
    }

    /// Open sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &StreamSession> {
        self.sessions.values()
    }

    /// Drop every session and turn record.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.turns.clear();
        self.saved.clear();
        self.retired.clear();
        self.retired_order.clear();
    }

    fn retire(&mut self, tag: &Tag) {
        if !self.retired.insert(tag.clone()) {
            return;
        }
        self.retired_order.push_back(tag.clone());
        while self.retired_order.len() > RETIRED_TAG_MEMORY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    fn prune_if_saved(&mut self, tag: &Tag) {
        if self.saved.remove(tag) {
            debug!(%tag, "turn record pruned");
            self.turns.remove(tag);
        }
    }

    fn live_session_mut(&mut self, tag: &Tag) -> Result<&mut StreamSession, IgnoreReason> {
        if self.retired.contains(tag) {
            return Err(IgnoreReason::RetiredTag(tag.clone()));
        }
        let node_id = self
            .turns
            .get(tag)
            .ok_or_else(|| IgnoreReason::UnknownTag(tag.clone()))?;
        self.sessions
            .get_mut(node_id)
            .ok_or_else(|| IgnoreReason::RetiredTag(tag.clone()))
    }

    fn finish(&mut self, node_id: &NodeId) -> Option<FinishedStream> {
        let session = self.sessions.remove(node_id)?;
        self.prune_if_saved(session.tag());
        info!(tag = %session.tag(), %node_id, chars = session.full_buffer().chars().count(), "stream finished");
        Some(FinishedStream {
            node_id: node_id.clone(),
            tag: session.tag().clone(),
            text: session.full_buffer().to_string(),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(16);

    fn reconciler() -> (StreamReconciler, Tag) {
        let mut r = StreamReconciler::new(PlaybackConfig::default());
        let tag = Tag::from("send_1");
        assert!(r
            .open(tag.clone(), NodeId::from("a1"), Instant::now())
            .is_applied());
        (r, tag)
    }

    fn drain(r: &mut StreamReconciler) -> Vec<FinishedStream> {
        let mut finished = Vec::new();
        for _ in 0..10_000 {
            let outcome = r.tick(FRAME);
            finished.extend(outcome.finished);
            if !r.has_backlog() {
                break;
            }
        }
        finished
    }

    #[test]
    fn test_duplicate_placeholder_is_noop() {
        let (mut r, tag) = reconciler();
        let again = r.open(tag, NodeId::from("a1"), Instant::now());
        assert_eq!(again, Applied::Ignored(IgnoreReason::Duplicate));
        assert_eq!(r.sessions().count(), 1);
    }

    #[test]
    fn test_chunks_drain_to_full_text() {
        let (mut r, tag) = reconciler();
        for chunk in ["Hel", "lo ", "world"] {
            assert!(r.push_chunk(&tag, chunk).is_applied());
        }
        assert!(r.has_backlog());

        let first = r.tick(FRAME);
        assert!(first.released >= 1);
        let session = r.session(&NodeId::from("a1")).unwrap();
        assert!(session.full_buffer().starts_with(session.visible_buffer()));

        drain(&mut r);
        assert!(!r.has_backlog());
        assert_eq!(
            r.session(&NodeId::from("a1")).unwrap().visible_buffer(),
            "Hello world"
        );
    }

    #[test]
    fn test_end_waits_for_backlog() {
        let (mut r, tag) = reconciler();
        let _ = r.push_chunk(&tag, "Hello world");

        let ended = r.end(&tag).into_applied().unwrap();
        assert!(ended.is_none());
        assert!(r.session(&NodeId::from("a1")).is_some());

        let finished = drain(&mut r);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].text, "Hello world");
        assert!(r.session(&NodeId::from("a1")).is_none());
        assert!(!r.push_chunk(&tag, "late").is_applied());
    }

    #[test]
    fn test_end_with_empty_backlog_finishes_now() {
        let (mut r, tag) = reconciler();
        let finished = r.end(&tag).into_applied().unwrap().unwrap();
        assert_eq!(finished.text, "");
        assert!(!r.is_streaming());
    }

    #[test]
    fn test_error_discards_unplayed_text() {
        let (mut r, tag) = reconciler();
        let _ = r.push_chunk(&tag, "abc");
        let _ = r.tick(Duration::ZERO);
        let _ = r.push_chunk(&tag, "def");

        let failed = r.fail(&tag, "model crashed").into_applied().unwrap();
        assert_eq!(failed.text, "a");
        assert_eq!(failed.error.as_deref(), Some("model crashed"));
        assert_eq!(
            r.push_chunk(&tag, "more"),
            Applied::Ignored(IgnoreReason::RetiredTag(tag.clone()))
        );
        assert!(!r.fail(&tag, "again").is_applied());
    }

    #[test]
    fn test_rewrite_moves_key_and_keeps_buffers() {
        let (mut r, tag) = reconciler();
        let _ = r.push_chunk(&tag, "Hello");
        let _ = r.tick(Duration::ZERO);

        assert!(r
            .rewrite(&NodeId::from("a1"), &NodeId::from("a1_durable"))
            .is_applied());
        assert!(r.session(&NodeId::from("a1")).is_none());
        let session = r.session(&NodeId::from("a1_durable")).unwrap();
        assert_eq!(session.node_id(), &NodeId::from("a1_durable"));
        assert_eq!(session.full_buffer(), "Hello");
        assert_eq!(session.visible_buffer(), "H");
        assert_eq!(r.node_for_tag(&tag), Some(&NodeId::from("a1_durable")));

        assert!(r.push_chunk(&tag, "!").is_applied());
    }

    #[test]
    fn test_unknown_tag_is_ignored() {
        let (mut r, _) = reconciler();
        assert_eq!(
            r.push_chunk(&Tag::from("nope"), "x"),
            Applied::Ignored(IgnoreReason::UnknownTag(Tag::from("nope")))
        );
    }

    #[test]
    fn test_turn_record_pruned_once_finished_and_saved() {
        let (mut r, tag) = reconciler();
        let _ = r.push_chunk(&tag, "hi");
        r.mark_saved(&tag);
        assert_eq!(r.tracked_turns(), 1);
        let _ = r.end(&tag);
        drain(&mut r);
        assert_eq!(r.tracked_turns(), 0);
        assert!(r.is_retired(&tag));

        let later = Tag::from("send_2");
        let _ = r.open(later.clone(), NodeId::from("a2"), Instant::now());
        assert!(r.end(&later).into_applied().unwrap().is_some());
        assert_eq!(r.node_for_tag(&later), Some(&NodeId::from("a2")));
        r.mark_saved(&later);
        assert_eq!(r.node_for_tag(&later), None);
        assert_eq!(r.tracked_turns(), 0);
    }

    #[test]
    fn test_retired_tags_are_bounded() {
        let mut r = StreamReconciler::new(PlaybackConfig::default());
        for i in 0..=RETIRED_TAG_MEMORY {
            let tag = Tag::from(format!("send_{i}"));
            let _ = r.open(tag.clone(), NodeId::from(format!("a{i}")), Instant::now());
            let _ = r.end(&tag);
            r.mark_saved(&tag);
        }
        assert_eq!(r.tracked_turns(), 0);
        assert_eq!(r.retired.len(), RETIRED_TAG_MEMORY);
        assert!(!r.is_retired(&Tag::from("send_0")));
        assert!(r.is_retired(&Tag::from(format!("send_{RETIRED_TAG_MEMORY}"))));
    }

    #[test]
    fn test_removed_node_retires_tag() {
        let (mut r, tag) = reconciler();
        assert_eq!(r.remove_nodes([&NodeId::from("a1")]), 1);
        assert!(!r.push_chunk(&tag, "x").is_applied());
        assert_eq!(r.tracked_turns(), 0);
    }
}
