//! Apply-or-ignore results for idempotent delta application.
//!
//! The transport delivers at least once, so duplicate and stale events are
//! expected. Instead of failing, delta operations report whether they changed
//! anything and, if not, why.

use crate::core::ids::{NodeId, Tag};

/// Why a delta or event was not applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The delta was already applied (duplicate delivery).
    Duplicate,
    /// A node referenced by the delta is not in the local mirror.
    UnknownNode(NodeId),
    /// No live operation or stream is registered for this tag.
    UnknownTag(Tag),
    /// The event belongs to another open conversation.
    ForeignConversation,
    /// The stream for this tag already failed or finished.
    RetiredTag(Tag),
    /// Applying would not change anything.
    NoChange,
}

/// Outcome of an idempotent operation.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Applied<T = ()> {
    /// The operation changed state.
    Applied(T),
    /// The operation was a no-op.
    Ignored(IgnoreReason),
}

impl<T> Applied<T> {
    /// Whether state changed.
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Reason for the no-op, if any.
    pub const fn ignore_reason(&self) -> Option<&IgnoreReason> {
        match self {
            Self::Applied(_) => None,
            Self::Ignored(reason) => Some(reason),
        }
    }

    /// Convert into an `Option` of the applied value.
    pub fn into_applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Ignored(_) => None,
        }
    }

    /// Drop the applied value.
    pub fn discard(self) -> Applied {
        match self {
            Self::Applied(_) => Applied::Applied(()),
            Self::Ignored(reason) => Applied::Ignored(reason),
        }
    }
}

impl Applied {
    /// Shorthand for a unit success.
    pub const fn done() -> Self {
        Self::Applied(())
    }
}
