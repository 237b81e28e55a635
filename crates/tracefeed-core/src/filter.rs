//! Event acceptance predicates.
//!
//! Each filter is a stateless, immutable value object exposing a single
//! `matches(event)` operation. A request's effective acceptance is the
//! logical AND over its [`FilterSet`], which holds at most one filter of
//! each [`FilterKind`]: inserting a filter of a kind already present
//! supersedes the earlier one (replacement, never in-place mutation).
//!
//! The four filter kinds:
//! - [`BlockFilter`] — rank window `[start, start + count)`
//! - [`RangeFilter`] — inclusive timestamp interval
//! - [`KindFilter`] — event category
//! - [`SourceFilter`] — originating source set

use std::fmt;

use smallvec::SmallVec;

use crate::event::{EventKind, SourceId, TraceEvent};
use crate::time::TimeRange;

/// Sentinel request count meaning "all remaining events".
pub const ALL_EVENTS: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// BlockFilter
// ---------------------------------------------------------------------------

/// Accepts events whose rank falls in `[start, start + count)`.
///
/// An event with an unknown rank always passes: the filter cannot reject
/// items it cannot place in the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFilter {
    start: u64,
    count: u64,
}

impl BlockFilter {
    /// The universal block filter: every rank, unbounded count.
    pub const ALL: BlockFilter = BlockFilter {
        start: 0,
        count: ALL_EVENTS,
    };

    /// Creates a filter for `count` events starting at `start`.
    ///
    /// A negative start index normalizes to 0.
    #[must_use]
    pub fn new(start: i64, count: u64) -> Self {
        #[allow(clippy::cast_sign_loss)] // clamped non-negative first
        let start = start.max(0) as u64;
        Self { start, count }
    }

    /// Returns the first accepted rank.
    #[inline]
    #[must_use]
    pub fn start_index(&self) -> u64 {
        self.start
    }

    /// Returns the number of events requested ([`ALL_EVENTS`] if unbounded).
    #[inline]
    #[must_use]
    pub fn nb_requested(&self) -> u64 {
        self.count
    }

    /// Returns `true` if the event's rank is inside the block, or unknown.
    #[must_use]
    pub fn matches<E: TraceEvent>(&self, event: &E) -> bool {
        match event.rank() {
            Some(rank) => rank >= self.start && rank < self.start.saturating_add(self.count),
            None => true,
        }
    }
}

impl fmt::Display for BlockFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block[{}+{}]", self.start, self.count)
    }
}

// ---------------------------------------------------------------------------
// RangeFilter
// ---------------------------------------------------------------------------

/// Accepts events whose timestamp falls within an inclusive [`TimeRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeFilter {
    range: TimeRange,
}

impl RangeFilter {
    /// The universal range filter.
    pub const ALL: RangeFilter = RangeFilter {
        range: TimeRange::ETERNITY,
    };

    /// Creates a filter accepting timestamps within `range`.
    #[must_use]
    pub fn new(range: TimeRange) -> Self {
        Self { range }
    }

    /// Returns the accepted time range.
    #[inline]
    #[must_use]
    pub fn time_range(&self) -> TimeRange {
        self.range
    }

    /// Returns `true` if the event's timestamp is inside the range.
    #[must_use]
    pub fn matches<E: TraceEvent>(&self, event: &E) -> bool {
        self.range.contains(event.timestamp())
    }
}

// ---------------------------------------------------------------------------
// KindFilter
// ---------------------------------------------------------------------------

/// Accepts events belonging to a designated [`EventKind`].
///
/// Delegates to [`TraceEvent::is_kind`], so hierarchical kind models keep
/// their subtype acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindFilter {
    kind: EventKind,
}

impl KindFilter {
    /// Creates a filter accepting events of `kind`.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self { kind }
    }

    /// Returns the accepted kind.
    #[inline]
    #[must_use]
    pub fn event_kind(&self) -> EventKind {
        self.kind
    }

    /// Returns `true` if the event is of (or subsumes into) the kind.
    #[must_use]
    pub fn matches<E: TraceEvent>(&self, event: &E) -> bool {
        event.is_kind(self.kind)
    }
}

// ---------------------------------------------------------------------------
// SourceFilter
// ---------------------------------------------------------------------------

/// Accepts events originating from a given set of sources.
///
/// The empty set is the universal acceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFilter {
    sources: SmallVec<[SourceId; 4]>,
}

impl SourceFilter {
    /// Creates a filter accepting events from any of `sources`.
    #[must_use]
    pub fn new(sources: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
        }
    }

    /// Creates the universal acceptor (empty source set).
    #[must_use]
    pub fn any() -> Self {
        Self {
            sources: SmallVec::new(),
        }
    }

    /// Returns the accepted sources.
    #[must_use]
    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    /// Returns `true` if the set is empty or contains the event's source.
    #[must_use]
    pub fn matches<E: TraceEvent>(&self, event: &E) -> bool {
        self.sources.is_empty() || self.sources.contains(&event.source())
    }
}

// ---------------------------------------------------------------------------
// EventFilter — tagged union
// ---------------------------------------------------------------------------

/// Discriminant identifying a filter's kind within a [`FilterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Rank window filter.
    Block,
    /// Timestamp interval filter.
    Range,
    /// Event category filter.
    Kind,
    /// Originating source filter.
    Source,
}

/// One acceptance predicate of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Rank window `[start, start + count)`.
    Block(BlockFilter),
    /// Inclusive timestamp interval.
    Range(RangeFilter),
    /// Event category.
    Kind(KindFilter),
    /// Originating source set.
    Source(SourceFilter),
}

impl EventFilter {
    /// Returns the filter's kind discriminant.
    #[must_use]
    pub fn kind(&self) -> FilterKind {
        match self {
            EventFilter::Block(_) => FilterKind::Block,
            EventFilter::Range(_) => FilterKind::Range,
            EventFilter::Kind(_) => FilterKind::Kind,
            EventFilter::Source(_) => FilterKind::Source,
        }
    }

    /// Evaluates the predicate against one event.
    #[must_use]
    pub fn matches<E: TraceEvent>(&self, event: &E) -> bool {
        match self {
            EventFilter::Block(f) => f.matches(event),
            EventFilter::Range(f) => f.matches(event),
            EventFilter::Kind(f) => f.matches(event),
            EventFilter::Source(f) => f.matches(event),
        }
    }
}

// ---------------------------------------------------------------------------
// FilterSet
// ---------------------------------------------------------------------------

/// A conjunction of filters, at most one per [`FilterKind`].
///
/// Always contains a block filter and a range filter (defaulting to the
/// universal acceptors) so the owning request can read its start index,
/// requested count, and time range without special cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet {
    filters: Vec<EventFilter>,
}

impl FilterSet {
    /// Creates a set holding only the universal block and range filters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: vec![
                EventFilter::Block(BlockFilter::ALL),
                EventFilter::Range(RangeFilter::ALL),
            ],
        }
    }

    /// Inserts a filter, superseding any earlier filter of the same kind.
    pub fn insert(&mut self, filter: EventFilter) {
        if let Some(slot) = self.filters.iter_mut().find(|f| f.kind() == filter.kind()) {
            *slot = filter;
        } else {
            self.filters.push(filter);
        }
    }

    /// Returns the active filter of the given kind, if any.
    #[must_use]
    pub fn get(&self, kind: FilterKind) -> Option<&EventFilter> {
        self.filters.iter().find(|f| f.kind() == kind)
    }

    /// Returns the active block filter.
    #[must_use]
    pub fn block(&self) -> BlockFilter {
        match self.get(FilterKind::Block) {
            Some(EventFilter::Block(f)) => *f,
            _ => BlockFilter::ALL,
        }
    }

    /// Returns the active range filter.
    #[must_use]
    pub fn range(&self) -> RangeFilter {
        match self.get(FilterKind::Range) {
            Some(EventFilter::Range(f)) => *f,
            _ => RangeFilter::ALL,
        }
    }

    /// Returns `true` if every active filter accepts the event.
    #[must_use]
    pub fn matches<E: TraceEvent>(&self, event: &E) -> bool {
        self.filters.iter().all(|f| f.matches(event))
    }

    /// Iterates over the active filters.
    pub fn iter(&self) -> impl Iterator<Item = &EventFilter> {
        self.filters.iter()
    }
}

impl Default for FilterSet {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
