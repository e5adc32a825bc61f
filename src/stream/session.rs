//! One streaming assistant turn.

use std::time::{Duration, Instant};

use crate::core::ids::{NodeId, Tag};

/// Buffers for a single streaming node.
///
/// `visible_buffer()` is always a prefix of `full_buffer()`; the split point
/// only moves forward and always sits on a char boundary.
#[derive(Clone, Debug)]
pub struct StreamSession {
    node_id: NodeId,
    tag: Tag,
    full: String,
    visible_len: usize,
    waiting: bool,
    ended: bool,
    opened_at: Instant,
}

impl StreamSession {
    /// Open a session for a freshly created placeholder.
    #[must_use]
    pub fn new(node_id: NodeId, tag: Tag, opened_at: Instant) -> Self {
        Self {
            node_id,
            tag,
            full: String::new(),
            visible_len: 0,
            waiting: true,
            ended: false,
            opened_at,
        }
    }

    /// Node currently attached to this session.
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Turn tag.
    #[must_use]
    pub const fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Everything received so far.
    #[must_use]
    pub fn full_buffer(&self) -> &str {
        &self.full
    }

    /// Text released to the UI so far.
    #[must_use]
    pub fn visible_buffer(&self) -> &str {
        &self.full[..self.visible_len]
    }

    /// Unreleased characters.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.full[self.visible_len..].chars().count()
    }

    /// Whether no chunk has arrived yet.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Time spent waiting for the first chunk, `None` once text arrived.
    #[must_use]
    pub fn waiting_elapsed(&self, now: Instant) -> Option<Duration> {
        self.waiting
            .then(|| now.saturating_duration_since(self.opened_at))
    }

    /// Whether `END` was observed.
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.ended
    }

    /// Ended and fully played back.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.ended && self.visible_len == self.full.len()
    }

    pub(crate) fn push(&mut self, text: &str) {
        self.full.push_str(text);
        self.waiting = false;
    }

    /// Release up to `count` characters; returns how many were released.
    pub(crate) fn release(&mut self, count: usize) -> usize {
        let rest = &self.full[self.visible_len..];
        let (released, bytes) = rest
            .char_indices()
            .take(count)
            .fold((0, 0), |(n, _), (idx, ch)| (n + 1, idx + ch.len_utf8()));
        self.visible_len += bytes;
        released
    }

    pub(crate) fn mark_ended(&mut self) {
        self.ended = true;
    }

    pub(crate) fn rename(&mut self, node_id: NodeId) {
        self.node_id = node_id;
    }
}
