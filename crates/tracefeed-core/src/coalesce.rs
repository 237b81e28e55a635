//! Coalesced requests: one fetch serving many logical consumers.
//!
//! A [`CoalescedRequest`] groups structurally-compatible child requests
//! behind a single base state machine. The processor drives the composite
//! exactly as it would a plain request; each accepted event fans out to
//! every still-open child that accepts it under its own filter set, so each
//! consumer observes its private completion and exactly the subset of
//! events it asked for.
//!
//! Compatibility testing is pure ([`CoalescedRequest::is_compatible`]);
//! growing the shared time range is a separate, explicit mutator
//! ([`CoalescedRequest::merge_range_from`]). The two are called together by
//! coalescing processors — keeping them apart makes the side effect visible
//! in the API instead of hiding it inside a predicate.
//!
//! # Atomicity
//!
//! Composite transitions are applied to each child in turn under that
//! child's own lock. A concurrent reader may briefly observe some children
//! transitioned and others not: the composite provides per-child atomicity,
//! not all-or-nothing atomicity across the group.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::event::TraceEvent;
use crate::request::{
    EventRequest, ParentNotify, RequestId, RequestPriority, RequestState,
};
use crate::time::TimeRange;

// ---------------------------------------------------------------------------
// CoalescedRequest
// ---------------------------------------------------------------------------

/// A composite request broadcasting one shared fetch to its children.
pub struct CoalescedRequest<E: TraceEvent> {
    base: EventRequest<E>,
    children: Mutex<Vec<Arc<EventRequest<E>>>>,
}

#[allow(clippy::missing_panics_doc)] // methods panic only on a poisoned mutex
impl<E: TraceEvent> CoalescedRequest<E> {
    /// Creates an empty universal composite at the given priority.
    #[must_use]
    pub fn with_priority(priority: RequestPriority) -> Arc<Self> {
        Arc::new(Self {
            base: EventRequest::all_events(priority),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Creates a composite adopting `first`'s index, count, priority, time
    /// range and block size, with `first` as its only child.
    #[must_use]
    pub fn from_request(first: &Arc<EventRequest<E>>) -> Arc<Self> {
        #[allow(clippy::cast_possible_wrap)] // start index is clamped non-negative
        let base = EventRequest::new(
            first.time_range(),
            first.start_index() as i64,
            first.nb_requested(),
            first.priority(),
        )
        .with_block_size(first.block_size());
        let composite = Arc::new(Self {
            base,
            children: Mutex::new(Vec::new()),
        });
        composite.add(first);
        composite
    }

    /// Appends a child and registers this composite as its parent.
    ///
    /// No uniqueness check is performed: a duplicate child is legal and
    /// separately receives every broadcast.
    pub fn add(self: &Arc<Self>, child: &Arc<EventRequest<E>>) {
        let parent: Arc<dyn ParentNotify> = Arc::clone(self) as Arc<dyn ParentNotify>;
        child.set_parent(Arc::downgrade(&parent));
        self.children.lock().unwrap().push(Arc::clone(child));
        tracing::debug!(composite = %self.base.id(), child = %child.id(), "request coalesced");
    }

    /// Pure compatibility predicate: a candidate can join this composite iff
    /// its start index, requested count and priority match exactly.
    ///
    /// Time ranges never reject a candidate; a coalescing processor widens
    /// the shared range with [`merge_range_from`](Self::merge_range_from)
    /// after a successful check.
    #[must_use]
    pub fn is_compatible(&self, candidate: &EventRequest<E>) -> bool {
        self.base.start_index() == candidate.start_index()
            && self.base.nb_requested() == candidate.nb_requested()
            && self.base.priority() == candidate.priority()
    }

    /// Widens the composite's time range to the union with the candidate's.
    pub fn merge_range_from(&self, candidate: &EventRequest<E>) {
        let merged = self.base.time_range().union(&candidate.time_range());
        self.base.set_time_range(merged);
    }

    // -- Delegated attributes ------------------------------------------------

    /// Returns the composite's own request id.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.base.id()
    }

    /// Returns the shared execution priority.
    #[must_use]
    pub fn priority(&self) -> RequestPriority {
        self.base.priority()
    }

    /// Returns the shared starting rank.
    #[must_use]
    pub fn start_index(&self) -> u64 {
        self.base.start_index()
    }

    /// Returns the shared requested count.
    #[must_use]
    pub fn nb_requested(&self) -> u64 {
        self.base.nb_requested()
    }

    /// Returns the (possibly widened) shared time range.
    #[must_use]
    pub fn time_range(&self) -> TimeRange {
        self.base.time_range()
    }

    /// Returns the delivery-chunk size hint.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.base.block_size()
    }

    /// Returns the composite's own read count.
    #[must_use]
    pub fn nb_read(&self) -> u64 {
        self.base.nb_read()
    }

    /// Returns the composite's own lifecycle state flag (not the computed
    /// projection — see [`is_completed`](Self::is_completed)).
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.base.state()
    }

    /// Returns `true` if the shared fetch accepts the event.
    #[must_use]
    pub fn matches(&self, event: &E) -> bool {
        self.base.matches(event)
    }

    /// Returns the ids of the current children, in insertion order.
    #[must_use]
    pub fn child_ids(&self) -> Vec<RequestId> {
        self.children.lock().unwrap().iter().map(|c| c.id()).collect()
    }

    /// Returns the number of children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    // -- Computed projections ------------------------------------------------

    /// Returns `true` if the composite's own flag is set, or if it has at
    /// least one child and every child reports completion.
    ///
    /// An empty composite is never complete through the child rule. The
    /// projection only affects the predicate: the composite's hooks and
    /// latches still fire solely through its own explicit transition.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        if self.base.is_completed() {
            return true;
        }
        let children = self.children.lock().unwrap();
        !children.is_empty() && children.iter().all(|c| c.is_completed())
    }

    /// Returns `true` under the same projection as
    /// [`is_completed`](Self::is_completed), substituted with the
    /// cancellation predicate.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.base.is_cancelled() {
            return true;
        }
        let children = self.children.lock().unwrap();
        !children.is_empty() && children.iter().all(|c| c.is_cancelled())
    }

    /// Returns `true` if the composite's own state machine reports failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.base.is_failed()
    }

    /// Returns `true` if the composite's own state machine is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.base.is_running()
    }

    // -- Broadcast -----------------------------------------------------------

    /// Accepts one delivery and fans it out.
    ///
    /// Base bookkeeping happens first (own read count, own observer). A
    /// non-`None` event is then forwarded to each not-yet-completed child
    /// that accepts it under its own filter set; the `None` end-of-stream
    /// sentinel is forwarded unconditionally to every still-open child.
    pub fn accept(&self, item: Option<&E>) {
        self.base.accept(item);
        let children = self.snapshot();
        match item {
            Some(event) => {
                for child in &children {
                    if !child.is_completed() && child.matches(event) {
                        child.accept(Some(event));
                    }
                }
            }
            None => {
                for child in &children {
                    if !child.is_completed() {
                        child.accept(None);
                    }
                }
            }
        }
    }

    // -- Transitions ---------------------------------------------------------

    /// Starts every not-yet-completed child, then the composite itself.
    pub fn start(&self) {
        self.forward_if_open(EventRequest::start);
        self.base.start();
    }

    /// Completes every not-yet-completed child, then the composite itself.
    pub fn complete(&self) {
        self.forward_if_open(EventRequest::complete);
        self.base.complete();
    }

    /// Fails every not-yet-completed child, then the composite itself.
    pub fn fail(&self) {
        self.forward_if_open(EventRequest::fail);
        self.base.fail();
    }

    /// Fails with a message, forwarding the same message to open children.
    pub fn fail_with(&self, message: impl Into<String>) {
        let message = message.into();
        for child in self.snapshot() {
            if !child.is_completed() {
                child.fail_with(message.clone());
            }
        }
        self.base.fail_with(message);
    }

    /// Cancels every child — including already-completed ones — then the
    /// composite itself.
    ///
    /// Cancellation must reach everyone, so unlike the other transitions it
    /// is forwarded unconditionally; on an already-completed child the call
    /// lands as a no-op by the idempotence rule.
    pub fn cancel(&self) {
        self.cancel_all();
        self.base.cancel();
    }

    /// Blocks until the composite's own state machine completes.
    pub fn wait_for_completion(&self) {
        self.base.wait_for_completion();
    }

    /// Forwards a transition to children that have not yet completed.
    fn forward_if_open(&self, op: fn(&EventRequest<E>)) {
        for child in self.snapshot() {
            if !child.is_completed() {
                op(&child);
            }
        }
    }

    /// Forwards cancellation to every child, completed or not.
    fn cancel_all(&self) {
        for child in self.snapshot() {
            child.cancel();
        }
    }

    fn snapshot(&self) -> Vec<Arc<EventRequest<E>>> {
        self.children.lock().unwrap().clone()
    }
}

impl<E: TraceEvent> ParentNotify for CoalescedRequest<E> {
    fn child_completed(&self, child: RequestId) {
        tracing::trace!(composite = %self.base.id(), %child, "child completed");
        // Propagate transitively through the composite's own parent, if any.
        self.base.child_completed(child);
    }
}

impl<E: TraceEvent> fmt::Debug for CoalescedRequest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescedRequest")
            .field("id", &self.base.id())
            .field("children", &self.child_ids())
            .field("state", &self.base.state())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, SourceId};
    use crate::filter::{EventFilter, RangeFilter, ALL_EVENTS};
    use crate::time::Timestamp;

    struct StubEvent {
        ts: i64,
        rank: Option<u64>,
    }

    impl TraceEvent for StubEvent {
        fn timestamp(&self) -> Timestamp {
            Timestamp(self.ts)
        }
        fn rank(&self) -> Option<u64> {
            self.rank
        }
        fn source(&self) -> SourceId {
            SourceId(0)
        }
        fn kind(&self) -> EventKind {
            EventKind(0)
        }
    }

    fn event(rank: u64, ts: i64) -> StubEvent {
        StubEvent { ts, rank: Some(rank) }
    }

    fn block_request(start: i64, count: u64) -> Arc<EventRequest<StubEvent>> {
        Arc::new(EventRequest::for_block(start, count))
    }

    // --- Construction ---

    #[test]
    fn test_from_request_adopts_attributes() {
        let first = Arc::new(EventRequest::<StubEvent>::new(
            TimeRange::new(Timestamp(0), Timestamp(100)),
            10,
            100,
            RequestPriority::Background,
        ));
        let composite = CoalescedRequest::from_request(&first);

        assert_eq!(composite.start_index(), 10);
        assert_eq!(composite.nb_requested(), 100);
        assert_eq!(composite.priority(), RequestPriority::Background);
        assert_eq!(composite.time_range(), first.time_range());
        assert_eq!(composite.child_ids(), vec![first.id()]);
    }

    #[test]
    fn test_with_priority_is_universal_and_empty() {
        let composite = CoalescedRequest::<StubEvent>::with_priority(RequestPriority::Foreground);
        assert_eq!(composite.start_index(), 0);
        assert_eq!(composite.nb_requested(), ALL_EVENTS);
        assert!(composite.time_range().is_eternity());
        assert_eq!(composite.child_count(), 0);
    }

    // --- Compatibility ---

    #[test]
    fn test_is_compatible_exact_match_only() {
        let composite = CoalescedRequest::from_request(&block_request(10, 100));

        assert!(composite.is_compatible(&EventRequest::for_block(10, 100)));
        assert!(!composite.is_compatible(&EventRequest::for_block(20, 100)));
        assert!(!composite.is_compatible(&EventRequest::for_block(10, 200)));
        assert!(!composite.is_compatible(&EventRequest::new(
            TimeRange::ETERNITY,
            10,
            100,
            RequestPriority::Background,
        )));
    }

    #[test]
    fn test_compatibility_check_is_pure() {
        let composite = CoalescedRequest::from_request(&block_request(10, 100));
        let candidate = EventRequest::<StubEvent>::new(
            TimeRange::new(Timestamp(0), Timestamp(50)),
            10,
            100,
            RequestPriority::Foreground,
        );

        let range_before = composite.time_range();
        assert!(composite.is_compatible(&candidate));
        // The predicate must not mutate the composite's range.
        assert_eq!(composite.time_range(), range_before);

        // The explicit mutator does.
        composite.merge_range_from(&candidate);
        assert_eq!(
            composite.time_range(),
            range_before.union(&candidate.time_range())
        );
    }

    #[test]
    fn test_merge_range_unions() {
        let first = Arc::new(EventRequest::<StubEvent>::new(
            TimeRange::new(Timestamp(100), Timestamp(200)),
            0,
            10,
            RequestPriority::Foreground,
        ));
        let composite = CoalescedRequest::from_request(&first);

        let other = EventRequest::<StubEvent>::new(
            TimeRange::new(Timestamp(150), Timestamp(400)),
            0,
            10,
            RequestPriority::Foreground,
        );
        composite.merge_range_from(&other);
        assert_eq!(
            composite.time_range(),
            TimeRange::new(Timestamp(100), Timestamp(400))
        );
    }

    // --- Broadcast ---

    #[test]
    fn test_broadcast_with_independent_child_filters() {
        // C1: ranks 0..10, any time. C2: ranks 5..15 but only ts >= 100.
        let c1 = block_request(0, 10);
        let c2 = block_request(5, 10);
        c2.add_filter(EventFilter::Range(RangeFilter::new(TimeRange::new(
            Timestamp(100),
            Timestamp::MAX,
        ))));

        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&c1);
        composite.add(&c2);
        composite.start();

        for rank in 0..15u64 {
            #[allow(clippy::cast_possible_wrap)]
            let e = event(rank, rank as i64);
            composite.accept(Some(&e));
        }

        // C1 saw ranks 0-9; C2 rejected everything (all timestamps < 100).
        assert_eq!(c1.nb_read(), 10);
        assert_eq!(c2.nb_read(), 0);
        // The composite counted every delivery it directly received.
        assert_eq!(composite.nb_read(), 15);
    }

    #[test]
    fn test_end_of_stream_forwarded_unconditionally() {
        let c1 = block_request(0, 5);
        // A filter that rejects everything reaching it.
        c1.add_filter(EventFilter::Range(RangeFilter::new(TimeRange::new(
            Timestamp(1000),
            Timestamp(2000),
        ))));
        let done = block_request(0, 5);

        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&c1);
        composite.add(&done);
        composite.start();
        done.complete();

        composite.accept(None);
        // The sentinel bypasses filters but skips completed children:
        // neither read count moved (None is never counted), and no panic.
        assert_eq!(c1.nb_read(), 0);
        assert_eq!(done.nb_read(), 0);
    }

    #[test]
    fn test_completed_children_stop_receiving() {
        let c1 = block_request(0, 10);
        let c2 = block_request(0, 10);
        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&c1);
        composite.add(&c2);
        composite.start();

        composite.accept(Some(&event(0, 0)));
        c1.cancel();
        composite.accept(Some(&event(1, 1)));

        assert_eq!(c1.nb_read(), 1);
        assert_eq!(c2.nb_read(), 2);
    }

    #[test]
    fn test_duplicate_children_each_receive() {
        let child = block_request(0, 10);
        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&child);
        composite.add(&child);
        composite.start();

        composite.accept(Some(&event(0, 0)));
        // The same request received the event twice.
        assert_eq!(child.nb_read(), 2);
    }

    // --- Transitions ---

    #[test]
    fn test_start_forwards_to_children() {
        let c1 = block_request(0, 10);
        let c2 = block_request(0, 10);
        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&c1);
        composite.add(&c2);

        composite.start();
        assert!(composite.is_running());
        assert!(c1.is_running());
        assert!(c2.is_running());
    }

    #[test]
    fn test_complete_forwards_to_open_children() {
        let c1 = block_request(0, 10);
        let c2 = block_request(0, 10);
        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&c1);
        composite.add(&c2);
        composite.start();

        c1.cancel();
        composite.complete();

        // c1 keeps its cancelled outcome; c2 completed normally.
        assert!(c1.is_cancelled());
        assert!(!c1.is_failed());
        assert!(c2.succeeded());
        assert!(composite.is_completed());
    }

    #[test]
    fn test_fail_forwards_to_open_children() {
        let c1 = block_request(0, 10);
        let c2 = block_request(0, 10);
        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&c1);
        composite.add(&c2);
        composite.start();

        composite.fail_with("backend gone");

        assert!(c1.is_failed());
        assert_eq!(c1.failure_message().as_deref(), Some("backend gone"));
        assert!(c2.is_failed());
        assert!(composite.is_failed());
        assert!(composite.is_completed());
    }

    #[test]
    fn test_cancel_reaches_every_child() {
        let c1 = block_request(0, 10);
        let c2 = block_request(0, 10);
        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&c1);
        composite.add(&c2);
        composite.start();

        // c1 already completed; cancel is still forwarded to it and lands
        // as a no-op, preserving its outcome.
        c1.complete();
        composite.cancel();

        assert!(c1.succeeded());
        assert!(!c1.is_cancelled());
        assert!(c2.is_cancelled());
        assert!(composite.is_cancelled());
    }

    // --- Computed projections ---

    #[test]
    fn test_empty_composite_never_completes_via_children() {
        let composite = CoalescedRequest::<StubEvent>::with_priority(RequestPriority::Foreground);
        assert!(!composite.is_completed());
        assert!(!composite.is_cancelled());
    }

    #[test]
    fn test_completion_projection_over_children() {
        let c1 = block_request(0, 10);
        let c2 = block_request(0, 10);
        let composite = CoalescedRequest::with_priority(RequestPriority::Foreground);
        composite.add(&c1);
        composite.add(&c2);
        composite.start();

        c1.cancel();
        assert!(!composite.is_completed());
        assert!(!composite.is_cancelled());

        c2.cancel();
        // Both children done: the composite reads as completed and
        // cancelled without its own transition ever being called.
        assert!(composite.is_completed());
        assert!(composite.is_cancelled());
        // Its own state flag is still Running — the projection is computed.
        assert_eq!(composite.state(), RequestState::Running);
    }

    // --- Parent chain ---

    #[test]
    fn test_child_completion_notifies_up_the_chain() {
        use crate::request::ParentNotify;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(AtomicUsize);
        impl ParentNotify for Counter {
            fn child_completed(&self, _child: RequestId) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let grandparent = Arc::new(Counter(AtomicUsize::new(0)));
        let child = block_request(0, 10);
        let composite = CoalescedRequest::from_request(&child);
        composite
            .base
            .set_parent(Arc::downgrade(&(Arc::clone(&grandparent) as Arc<dyn ParentNotify>)));

        child.start();
        child.complete();
        // child -> composite -> grandparent
        assert_eq!(grandparent.0.load(Ordering::SeqCst), 1);
    }
}
