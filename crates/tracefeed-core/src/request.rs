//! The fetch request state machine.
//!
//! An [`EventRequest`] describes one bounded or unbounded fetch of sequential
//! trace events: a starting rank, a requested count ([`ALL_EVENTS`] for
//! "everything"), a time range of interest, and an execution priority. The
//! request itself is a passive state object — a processor drives it through
//! `Pending → Running → Completed` and feeds it events via [`EventRequest::accept`],
//! while any number of client threads observe state or block in the wait
//! operations.
//!
//! A request with an eternal time range is a plain indexed fetch; a bounded
//! range makes it time-aware. There is no subclass hierarchy: both flavors
//! are this one type, distinguished by their filter values.
//!
//! # Concurrency
//!
//! All mutable state lives behind one coarse mutex so that check-then-act
//! sequences (such as the completed guard in the transition operations) are
//! atomic. Observer hooks run outside the lock. The two wait operations are
//! backed by one-shot [`TransitionLatch`]es and are safe in either ordering
//! of transition and wait.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::event::TraceEvent;
use crate::filter::{BlockFilter, EventFilter, FilterSet, RangeFilter, ALL_EVENTS};
use crate::latch::{TransitionLatch, WaitError};
use crate::time::TimeRange;

/// Default delivery-chunk size hint, in events.
///
/// Only meaningful for background requests: a processor working through a
/// background fetch yields to foreground work between chunks of this size.
pub const DEFAULT_BLOCK_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// Process-wide request id counter. Ids are unique per process run and are
/// never reused; they are not persisted anywhere.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Unique request identifier, monotonically assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Rewinds the request id counter to its initial value.
///
/// Test-isolation escape hatch only: calling this while requests are live
/// makes ids ambiguous. Never call it from production code.
pub fn reset_request_ids() {
    NEXT_REQUEST_ID.store(1, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// RequestPriority / RequestState / RequestOutcome
// ---------------------------------------------------------------------------

/// Execution priority for the processor's scheduling decision.
///
/// Exactly two levels; there is no numeric priority and no preemption beyond
/// this binary distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestPriority {
    /// Interactive work: fires immediately, never yields.
    #[default]
    Foreground,
    /// Bulk work: may be held briefly for coalescing and yields to
    /// foreground requests between delivery chunks.
    Background,
}

/// Lifecycle state of a request. Transitions are monotonic; `Completed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Constructed, not yet picked up by a processor.
    Pending,
    /// The processor is delivering events.
    Running,
    /// Terminal: no further state or outcome changes.
    Completed,
}

/// How a completed request ended.
///
/// Failure takes precedence over cancellation when both could apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Ran to normal completion.
    Succeeded,
    /// The processor reported an error.
    Failed,
    /// An external actor aborted the request.
    Cancelled,
}

// ---------------------------------------------------------------------------
// RequestObserver
// ---------------------------------------------------------------------------

/// Consumer-side notification hooks.
///
/// All methods have no-op defaults; implement only what you need. Exactly
/// one of the three outcome hooks fires per request, followed
/// unconditionally by [`on_completed`](RequestObserver::on_completed).
/// Hooks are invoked synchronously by the processor thread, outside the
/// request's internal lock.
pub trait RequestObserver<E: TraceEvent>: Send + Sync {
    /// The request transitioned from Pending to Running.
    fn on_started(&self) {}

    /// One event was accepted. Invoked once per non-sentinel delivery.
    fn on_event(&self, _event: &E) {}

    /// The request completed normally.
    fn on_success(&self) {}

    /// The request completed with a processor-reported failure.
    fn on_failure(&self) {}

    /// The request was cancelled.
    fn on_cancelled(&self) {}

    /// The request reached the Completed state, whatever the outcome.
    fn on_completed(&self) {}
}

// ---------------------------------------------------------------------------
// ParentNotify
// ---------------------------------------------------------------------------

/// Upward completion notification for hierarchical request aggregation.
///
/// A request holds at most a weak reference to its parent: the parent does
/// not own the child's lifetime. Notification propagates transitively — a
/// notified parent forwards to its own parent in turn.
pub trait ParentNotify: Send + Sync {
    /// A direct child of this request has reached the Completed state.
    fn child_completed(&self, child: RequestId);
}

// ---------------------------------------------------------------------------
// EventRequest
// ---------------------------------------------------------------------------

struct Inner {
    filters: FilterSet,
    nb_read: u64,
    state: RequestState,
    failed: bool,
    cancelled: bool,
    failure: Option<String>,
    parent: Option<Weak<dyn ParentNotify>>,
}

/// A single fetch request: value object plus state machine.
///
/// Constructed by a consumer, then handed to a processor which owns its
/// lifecycle from `start()` to exactly one of `complete()`, `fail()`, or
/// `cancel()`. Clients observe via the predicates, the wait operations, or
/// an attached [`RequestObserver`].
pub struct EventRequest<E: TraceEvent> {
    id: RequestId,
    priority: RequestPriority,
    block_size: usize,
    observer: Mutex<Option<Arc<dyn RequestObserver<E>>>>,
    inner: Mutex<Inner>,
    started: TransitionLatch,
    completed: TransitionLatch,
}

#[allow(clippy::missing_panics_doc)] // methods panic only on a poisoned mutex
impl<E: TraceEvent> EventRequest<E> {
    /// Full constructor: events in `range`, starting at `start_index`,
    /// `nb_requested` of them, at `priority`.
    ///
    /// A negative `start_index` normalizes to 0; `nb_requested` of
    /// [`ALL_EVENTS`] means "all remaining".
    #[must_use]
    pub fn new(
        range: TimeRange,
        start_index: i64,
        nb_requested: u64,
        priority: RequestPriority,
    ) -> Self {
        let mut filters = FilterSet::new();
        filters.insert(EventFilter::Block(BlockFilter::new(
            start_index,
            nb_requested,
        )));
        filters.insert(EventFilter::Range(RangeFilter::new(range)));
        Self {
            id: RequestId::next(),
            priority,
            block_size: DEFAULT_BLOCK_SIZE,
            observer: Mutex::new(None),
            inner: Mutex::new(Inner {
                filters,
                nb_read: 0,
                state: RequestState::Pending,
                failed: false,
                cancelled: false,
                failure: None,
                parent: None,
            }),
            started: TransitionLatch::new(),
            completed: TransitionLatch::new(),
        }
    }

    /// All events, whole timeline, at the given priority.
    #[must_use]
    pub fn all_events(priority: RequestPriority) -> Self {
        Self::new(TimeRange::ETERNITY, 0, ALL_EVENTS, priority)
    }

    /// All events within a time range, foreground priority.
    #[must_use]
    pub fn for_range(range: TimeRange) -> Self {
        Self::new(range, 0, ALL_EVENTS, RequestPriority::Foreground)
    }

    /// A block of events by rank, whole timeline, foreground priority.
    #[must_use]
    pub fn for_block(start_index: i64, nb_requested: u64) -> Self {
        Self::new(
            TimeRange::ETERNITY,
            start_index,
            nb_requested,
            RequestPriority::Foreground,
        )
    }

    /// Sets the delivery-chunk size hint. Builder-style, before sharing.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Attaches the consumer notification hooks. Builder-style, before
    /// submission to a processor.
    #[must_use]
    pub fn with_observer(self, observer: Arc<dyn RequestObserver<E>>) -> Self {
        *self.observer.lock().unwrap() = Some(observer);
        self
    }

    // -- Accessors -----------------------------------------------------------

    /// Returns the unique request id.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns the execution priority.
    #[must_use]
    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    /// Returns the delivery-chunk size hint.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the rank of the first requested event.
    #[must_use]
    pub fn start_index(&self) -> u64 {
        self.inner.lock().unwrap().filters.block().start_index()
    }

    /// Returns the number of events requested ([`ALL_EVENTS`] if unbounded).
    #[must_use]
    pub fn nb_requested(&self) -> u64 {
        self.inner.lock().unwrap().filters.block().nb_requested()
    }

    /// Returns the time range of interest.
    #[must_use]
    pub fn time_range(&self) -> TimeRange {
        self.inner.lock().unwrap().filters.range().time_range()
    }

    /// Returns the number of events read so far.
    #[must_use]
    pub fn nb_read(&self) -> u64 {
        self.inner.lock().unwrap().nb_read
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.inner.lock().unwrap().state
    }

    /// Returns `true` if the request is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == RequestState::Running
    }

    /// Returns `true` if the request has reached the terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == RequestState::Completed
    }

    /// Returns `true` if the request completed with a reported failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.inner.lock().unwrap().failed
    }

    /// Returns `true` if the request was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    /// Returns `true` if the request completed normally.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == RequestState::Completed && !inner.failed && !inner.cancelled
    }

    /// Returns the outcome, or `None` while the request is still open.
    ///
    /// Failure is checked before cancellation, fixing the completion
    /// dispatch precedence.
    #[must_use]
    pub fn outcome(&self) -> Option<RequestOutcome> {
        let inner = self.inner.lock().unwrap();
        if inner.state != RequestState::Completed {
            return None;
        }
        Some(if inner.failed {
            RequestOutcome::Failed
        } else if inner.cancelled {
            RequestOutcome::Cancelled
        } else {
            RequestOutcome::Succeeded
        })
    }

    /// Returns the failure message supplied via
    /// [`fail_with`](EventRequest::fail_with), if any.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        self.inner.lock().unwrap().failure.clone()
    }

    // -- Filters -------------------------------------------------------------

    /// Returns `true` if every active filter accepts the event.
    #[must_use]
    pub fn matches(&self, event: &E) -> bool {
        self.inner.lock().unwrap().filters.matches(event)
    }

    /// Registers a filter, superseding any active filter of the same kind.
    pub fn add_filter(&self, filter: EventFilter) {
        self.inner.lock().unwrap().filters.insert(filter);
    }

    /// Narrows the starting index, e.g. once a processor has translated the
    /// time range into a rank. Replaces the block filter wholesale.
    pub fn set_start_index(&self, start_index: i64) {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.filters.block().nb_requested();
        inner
            .filters
            .insert(EventFilter::Block(BlockFilter::new(start_index, count)));
    }

    /// Replaces the requested count. Replaces the block filter wholesale.
    pub fn set_nb_requested(&self, nb_requested: u64) {
        let mut inner = self.inner.lock().unwrap();
        #[allow(clippy::cast_possible_wrap)] // start came from a clamped i64
        let start = inner.filters.block().start_index() as i64;
        inner
            .filters
            .insert(EventFilter::Block(BlockFilter::new(start, nb_requested)));
    }

    /// Replaces the time range of interest. Replaces the range filter
    /// wholesale.
    pub fn set_time_range(&self, range: TimeRange) {
        self.inner
            .lock()
            .unwrap()
            .filters
            .insert(EventFilter::Range(RangeFilter::new(range)));
    }

    // -- Parent --------------------------------------------------------------

    /// Registers a parent to notify on completion. The reference is weak:
    /// the parent does not own this request's lifetime.
    pub fn set_parent(&self, parent: Weak<dyn ParentNotify>) {
        self.inner.lock().unwrap().parent = Some(parent);
    }

    fn notify_parent(&self) {
        let parent = self.inner.lock().unwrap().parent.clone();
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            parent.child_completed(self.id);
        }
    }

    // -- Transitions (processor side) ---------------------------------------

    /// Transitions Pending → Running.
    ///
    /// The started hook and latch fire exactly once, on the actual
    /// transition; repeated calls while Running are harmless and a call
    /// after completion is a no-op.
    pub fn start(&self) {
        let fired = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == RequestState::Pending {
                inner.state = RequestState::Running;
                true
            } else {
                false
            }
        };
        if fired {
            tracing::debug!(id = %self.id, "request started");
            if let Some(observer) = self.observer.lock().unwrap().clone() {
                observer.on_started();
            }
            self.started.open();
        }
    }

    /// Accepts one delivery. The sole data-ingestion entry point.
    ///
    /// Increments the read count iff `item` is non-`None`; a `None` is the
    /// end-of-stream sentinel and is counted nowhere. The call is
    /// synchronous: the processor blocks until it returns before supplying
    /// the next item. No filtering happens here — the counter counts every
    /// non-`None` delivery it directly receives.
    pub fn accept(&self, item: Option<&E>) {
        if item.is_some() {
            self.inner.lock().unwrap().nb_read += 1;
        }
        if let Some(event) = item {
            if let Some(observer) = self.observer.lock().unwrap().clone() {
                observer.on_event(event);
            }
        }
    }

    /// Completes the request normally. No-op if already completed.
    pub fn complete(&self) {
        self.finish(false, false, None);
    }

    /// Completes the request as failed. No-op if already completed.
    pub fn fail(&self) {
        self.finish(true, false, None);
    }

    /// Completes the request as failed with a status message.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.finish(true, false, Some(message.into()));
    }

    /// Completes the request as cancelled. Unconditional and idempotent.
    pub fn cancel(&self) {
        self.finish(false, true, None);
    }

    /// The shared completion path. The completed guard, flag assignment and
    /// state change happen in one critical section; hooks run outside it;
    /// the latches open last so waiters observe the final state.
    fn finish(&self, failed: bool, cancelled: bool, failure: Option<String>) {
        let nb_read = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == RequestState::Completed {
                return;
            }
            inner.state = RequestState::Completed;
            inner.failed = failed;
            inner.cancelled = cancelled;
            inner.failure = failure;
            inner.nb_read
        };
        tracing::debug!(
            id = %self.id,
            failed,
            cancelled,
            nb_read,
            "request completed"
        );
        if let Some(observer) = self.observer.lock().unwrap().clone() {
            // Outcome precedence: failure before cancellation.
            if failed {
                observer.on_failure();
            } else if cancelled {
                observer.on_cancelled();
            } else {
                observer.on_success();
            }
            observer.on_completed();
        }
        self.notify_parent();
        // A request that short-circuits Pending → Completed must still
        // release threads blocked in wait_for_start.
        self.started.open();
        self.completed.open();
    }

    // -- Waits (client side) -------------------------------------------------

    /// Blocks until the request has started (or completed without starting).
    pub fn wait_for_start(&self) {
        self.started.wait();
    }

    /// Bounded [`wait_for_start`](EventRequest::wait_for_start).
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] if the request did not start in time.
    pub fn wait_for_start_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        self.started.wait_timeout(timeout)
    }

    /// Async [`wait_for_start`](EventRequest::wait_for_start).
    pub async fn wait_for_start_async(&self) {
        self.started.wait_async().await;
    }

    /// Blocks until the request has completed.
    ///
    /// Returns immediately if completion already happened; callers must
    /// check the outcome predicates, not just completion, to distinguish
    /// success from failure or cancellation.
    pub fn wait_for_completion(&self) {
        self.completed.wait();
    }

    /// Bounded [`wait_for_completion`](EventRequest::wait_for_completion).
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] if the request did not complete in time.
    pub fn wait_for_completion_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        self.completed.wait_timeout(timeout)
    }

    /// Async [`wait_for_completion`](EventRequest::wait_for_completion).
    pub async fn wait_for_completion_async(&self) {
        self.completed.wait_async().await;
    }
}

impl<E: TraceEvent> ParentNotify for EventRequest<E> {
    fn child_completed(&self, _child: RequestId) {
        // Propagate transitively: a notified request forwards to its own
        // parent, identifying itself as the completed child.
        self.notify_parent();
    }
}

impl<E: TraceEvent> fmt::Debug for EventRequest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRequest")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("nb_read", &self.nb_read())
            .finish_non_exhaustive()
    }
}

impl<E: TraceEvent> fmt::Display for EventRequest<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
