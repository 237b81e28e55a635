//! End-to-end coalesced fetch tests.
//!
//! Exercises the full submit → coalesce → execute → complete cycle against
//! an in-memory source, including mixed per-consumer filtering, partial
//! cancellation, and failure propagation.

use std::sync::Arc;
use std::time::Duration;

use tracefeed_core::provider::{EventSource, ProviderConfig};
use tracefeed_core::{
    EventFilter, EventKind, EventProvider, EventRequest, ProviderError, RequestPriority, SourceId,
    TimeRange, Timestamp, TraceEvent,
};

#[derive(Clone)]
struct SynthEvent {
    rank: u64,
    ts: i64,
}

impl TraceEvent for SynthEvent {
    fn timestamp(&self) -> Timestamp {
        Timestamp(self.ts)
    }
    fn rank(&self) -> Option<u64> {
        Some(self.rank)
    }
    fn source(&self) -> SourceId {
        SourceId(0)
    }
    fn kind(&self) -> EventKind {
        EventKind(0)
    }
}

/// Serves `len` events; event `i` has rank `i` and timestamp `i`.
struct SynthSource {
    len: u64,
}

impl EventSource<SynthEvent> for SynthSource {
    fn next_event(&mut self, rank: u64) -> Result<Option<SynthEvent>, ProviderError> {
        if rank < self.len {
            Ok(Some(SynthEvent {
                rank,
                ts: i64::try_from(rank).unwrap(),
            }))
        } else {
            Ok(None)
        }
    }
}

const WAIT: Duration = Duration::from_secs(5);

fn fast_provider(len: u64) -> EventProvider<SynthEvent> {
    EventProvider::with_config(
        SynthSource { len },
        ProviderConfig {
            coalescing_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        },
    )
}

fn background(start: i64, count: u64) -> Arc<EventRequest<SynthEvent>> {
    Arc::new(EventRequest::new(
        TimeRange::ETERNITY,
        start,
        count,
        RequestPriority::Background,
    ))
}

// ── Scenario 1: shared batch, independent filters ──

#[test]
fn test_coalesced_consumers_see_their_own_subsets() {
    let provider = fast_provider(100);

    // Same block, but the second consumer only cares about a narrow slice
    // of time that no event in the block falls into.
    let broad = background(0, 10);
    let narrow = background(0, 10);
    narrow.add_filter(EventFilter::Range(
        tracefeed_core::filter::RangeFilter::new(TimeRange::new(
            Timestamp(1_000),
            Timestamp(2_000),
        )),
    ));

    provider.submit(&broad).unwrap();
    provider.submit(&narrow).unwrap();
    broad.wait_for_completion_timeout(WAIT).unwrap();
    narrow.wait_for_completion_timeout(WAIT).unwrap();

    assert!(broad.succeeded());
    assert!(narrow.succeeded());
    assert_eq!(broad.nb_read(), 10);
    assert_eq!(narrow.nb_read(), 0);

    // One pass over the source served both.
    let metrics = provider.metrics();
    assert_eq!(metrics.batches_fired(), 1);
    assert_eq!(metrics.requests_coalesced(), 1);
}

// ── Scenario 2: range widening ──

#[test]
fn test_merged_batch_covers_both_time_ranges() {
    let provider = fast_provider(100);

    let early = Arc::new(EventRequest::new(
        TimeRange::new(Timestamp(0), Timestamp(9)),
        0,
        tracefeed_core::ALL_EVENTS,
        RequestPriority::Background,
    ));
    let late = Arc::new(EventRequest::new(
        TimeRange::new(Timestamp(50), Timestamp(59)),
        0,
        tracefeed_core::ALL_EVENTS,
        RequestPriority::Background,
    ));

    provider.submit(&early).unwrap();
    provider.submit(&late).unwrap();
    early.wait_for_completion_timeout(WAIT).unwrap();
    late.wait_for_completion_timeout(WAIT).unwrap();

    // The widened batch spanned 0..=59 but each consumer only saw its own
    // ten timestamps.
    assert_eq!(early.nb_read(), 10);
    assert_eq!(late.nb_read(), 10);
    assert_eq!(provider.metrics().batches_fired(), 1);
}

// ── Scenario 3: partial cancellation ──

#[test]
fn test_one_consumer_cancelling_does_not_starve_the_other() {
    let provider = fast_provider(100);

    let keeper = background(0, 20);
    let quitter = background(0, 20);

    provider.submit(&keeper).unwrap();
    provider.submit(&quitter).unwrap();
    quitter.cancel();

    keeper.wait_for_completion_timeout(WAIT).unwrap();
    quitter.wait_for_completion_timeout(WAIT).unwrap();

    assert!(keeper.succeeded());
    assert_eq!(keeper.nb_read(), 20);
    assert!(quitter.is_cancelled());
    assert_eq!(quitter.nb_read(), 0);
}

// ── Scenario 4: failure propagation ──

struct FlakySource {
    fail_at: u64,
}

impl EventSource<SynthEvent> for FlakySource {
    fn next_event(&mut self, rank: u64) -> Result<Option<SynthEvent>, ProviderError> {
        if rank >= self.fail_at {
            Err(ProviderError::Source("read past corrupt segment".into()))
        } else {
            Ok(Some(SynthEvent {
                rank,
                ts: i64::try_from(rank).unwrap(),
            }))
        }
    }
}

#[test]
fn test_source_failure_reaches_every_consumer() {
    let provider = EventProvider::with_config(
        FlakySource { fail_at: 5 },
        ProviderConfig {
            coalescing_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        },
    );

    let a = background(0, 20);
    let b = background(0, 20);
    provider.submit(&a).unwrap();
    provider.submit(&b).unwrap();
    a.wait_for_completion_timeout(WAIT).unwrap();
    b.wait_for_completion_timeout(WAIT).unwrap();

    for request in [&a, &b] {
        assert!(request.is_failed());
        assert!(!request.is_cancelled());
        assert!(request
            .failure_message()
            .is_some_and(|m| m.contains("corrupt segment")));
        // Events before the failure point were still delivered.
        assert_eq!(request.nb_read(), 5);
    }
}

// ── Scenario 5: foreground never waits for the coalescing window ──

#[test]
fn test_foreground_fires_without_coalescing_delay() {
    let provider = EventProvider::with_config(
        SynthSource { len: 100 },
        ProviderConfig {
            coalescing_delay: Duration::from_secs(60),
            poll_interval: Duration::from_millis(5),
        },
    );

    let request = Arc::new(EventRequest::for_block(0, 10));
    provider.submit(&request).unwrap();
    // Must complete long before the 60s background window.
    request
        .wait_for_completion_timeout(Duration::from_secs(2))
        .unwrap();
    assert!(request.succeeded());
}
