//! The trace event item model.
//!
//! Requests and filters are generic over [`TraceEvent`], the minimal contract
//! an item must satisfy to flow through the fetch pipeline: a timestamp, an
//! optional sequence rank, an originating source, and a kind discriminant.
//!
//! Kinds are tagged values rather than runtime type checks. An implementation
//! that models a kind hierarchy (where one kind subsumes another) overrides
//! [`TraceEvent::is_kind`] to accept its ancestors.

use std::fmt;

use crate::time::Timestamp;

// ---------------------------------------------------------------------------
// SourceId
// ---------------------------------------------------------------------------

/// Identifier of the trace or data source an event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Tagged discriminant for an event's category.
///
/// Sources assign their own kind values; the core only compares them. The
/// subtype relation, if any, lives in [`TraceEvent::is_kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKind(pub u32);

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TraceEvent
// ---------------------------------------------------------------------------

/// A single item delivered to a fetch request.
///
/// Events are immutable once produced and are shared by reference across the
/// broadcast fan-out, so implementations must be `Send + Sync`.
pub trait TraceEvent: Send + Sync + 'static {
    /// The event's position on the trace timeline.
    fn timestamp(&self) -> Timestamp;

    /// The event's sequence rank within its source, if known.
    ///
    /// Rank is optional: sources that deliver events before indexing has
    /// caught up report `None`, and rank-based filters must accept such
    /// events (they cannot reject what they cannot place).
    fn rank(&self) -> Option<u64>;

    /// The source this event originates from.
    fn source(&self) -> SourceId;

    /// The event's kind discriminant.
    fn kind(&self) -> EventKind;

    /// Returns `true` if this event belongs to `kind`.
    ///
    /// The default is exact equality. Implementations with hierarchical
    /// kinds override this to also accept ancestor kinds.
    fn is_kind(&self, kind: EventKind) -> bool {
        self.kind() == kind
    }
}
