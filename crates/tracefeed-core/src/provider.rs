//! The event provider: request intake, coalescing, and execution.
//!
//! An [`EventProvider`] owns one [`EventSource`] and a worker thread that
//! drains a queue of pending batches. Each batch is a [`CoalescedRequest`]:
//! submitting a request either joins an existing compatible batch or opens a
//! new one. Foreground batches fire immediately; background batches are held
//! for a short coalescing window so that near-simultaneous submissions share
//! one pass over the source, and they yield to due foreground work between
//! delivery chunks.
//!
//! Every submitted request is guaranteed to complete: normally when its
//! batch runs out of events, as failed when the source errors, or as
//! cancelled when the provider shuts down before the batch fires.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::coalesce::CoalescedRequest;
use crate::event::TraceEvent;
use crate::request::{EventRequest, RequestPriority};

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Failures surfaced by the provider or its source.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The underlying event source reported an error.
    #[error("event source error: {0}")]
    Source(String),

    /// The provider has shut down and accepts no further requests.
    #[error("provider is shut down")]
    ShutDown,
}

// ---------------------------------------------------------------------------
// EventSource
// ---------------------------------------------------------------------------

/// A sequential, rank-addressable supplier of trace events.
///
/// The provider's worker thread owns the source exclusively; implementations
/// need no internal synchronization.
pub trait EventSource<E: TraceEvent>: Send + 'static {
    /// Returns the event at `rank`, `Ok(None)` once the source is exhausted.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Source`] on a read failure; the in-flight batch is
    /// then completed as failed.
    fn next_event(&mut self, rank: u64) -> Result<Option<E>, ProviderError>;
}

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for the provider's scheduling behavior.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// How long a background batch is held open for further coalescing
    /// before it fires. Foreground batches never wait.
    pub coalescing_delay: Duration,

    /// Worker wake-up interval when no submission nudges it.
    pub poll_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            coalescing_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(50),
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderMetrics
// ---------------------------------------------------------------------------

/// Monotonic provider counters, readable from any thread.
#[derive(Debug, Default)]
pub struct ProviderMetrics {
    requests_submitted: AtomicU64,
    requests_coalesced: AtomicU64,
    batches_fired: AtomicU64,
    batches_failed: AtomicU64,
    events_delivered: AtomicU64,
}

impl ProviderMetrics {
    /// Total requests accepted by [`EventProvider::submit`].
    #[must_use]
    pub fn requests_submitted(&self) -> u64 {
        self.requests_submitted.load(Ordering::Relaxed)
    }

    /// Requests that joined an already-pending batch.
    #[must_use]
    pub fn requests_coalesced(&self) -> u64 {
        self.requests_coalesced.load(Ordering::Relaxed)
    }

    /// Batches the worker has executed.
    #[must_use]
    pub fn batches_fired(&self) -> u64 {
        self.batches_fired.load(Ordering::Relaxed)
    }

    /// Batches that ended in a source failure.
    #[must_use]
    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    /// Events delivered across all batches.
    #[must_use]
    pub fn events_delivered(&self) -> u64 {
        self.events_delivered.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// EventProvider
// ---------------------------------------------------------------------------

enum Command {
    Poll,
    Shutdown,
}

struct PendingBatch<E: TraceEvent> {
    composite: Arc<CoalescedRequest<E>>,
    fire_at: Instant,
}

/// Executes fetch requests against one event source.
pub struct EventProvider<E: TraceEvent> {
    pending: Arc<Mutex<Vec<PendingBatch<E>>>>,
    metrics: Arc<ProviderMetrics>,
    config: ProviderConfig,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<Command>,
    worker: Option<thread::JoinHandle<()>>,
}

#[allow(clippy::missing_panics_doc)] // methods panic only on a poisoned mutex
impl<E: TraceEvent> EventProvider<E> {
    /// Spawns a provider over `source` with default configuration.
    #[must_use]
    pub fn new(source: impl EventSource<E>) -> Self {
        Self::with_config(source, ProviderConfig::default())
    }

    /// Spawns a provider over `source` with explicit configuration.
    #[must_use]
    pub fn with_config(source: impl EventSource<E>, config: ProviderConfig) -> Self {
        let pending = Arc::new(Mutex::new(Vec::new()));
        let metrics = Arc::new(ProviderMetrics::default());
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let worker = {
            let mut worker = Worker {
                source: Box::new(source),
                pending: Arc::clone(&pending),
                metrics: Arc::clone(&metrics),
                rx,
                poll_interval: config.poll_interval,
            };
            thread::Builder::new()
                .name("event-provider".into())
                .spawn(move || worker.run())
                .ok()
        };

        Self {
            pending,
            metrics,
            config,
            running,
            tx,
            worker,
        }
    }

    /// Returns the provider's counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<ProviderMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Submits a request for execution.
    ///
    /// The request joins a pending compatible batch when one exists
    /// (widening that batch's time range); otherwise it opens a new batch.
    /// Foreground batches are due immediately; background batches are held
    /// for the configured coalescing window.
    ///
    /// # Errors
    ///
    /// [`ProviderError::ShutDown`] if the provider is no longer running.
    pub fn submit(&self, request: &Arc<EventRequest<E>>) -> Result<(), ProviderError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ProviderError::ShutDown);
        }

        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(batch) = pending
                .iter()
                .find(|b| b.composite.is_compatible(request))
            {
                batch.composite.merge_range_from(request);
                batch.composite.add(request);
                self.metrics.requests_coalesced.fetch_add(1, Ordering::Relaxed);
            } else {
                let fire_at = match request.priority() {
                    RequestPriority::Foreground => Instant::now(),
                    RequestPriority::Background => Instant::now() + self.config.coalescing_delay,
                };
                pending.push(PendingBatch {
                    composite: CoalescedRequest::from_request(request),
                    fire_at,
                });
            }
        }
        self.metrics.requests_submitted.fetch_add(1, Ordering::Relaxed);

        // Nudge the worker; a disconnected channel means it already exited.
        if self.tx.send(Command::Poll).is_err() {
            return Err(ProviderError::ShutDown);
        }
        Ok(())
    }

    /// Stops the worker, cancelling batches that have not fired.
    ///
    /// Idempotent; blocks until the worker thread has exited.
    pub fn shutdown(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<E: TraceEvent> Drop for EventProvider<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker<E: TraceEvent> {
    source: Box<dyn EventSource<E>>,
    pending: Arc<Mutex<Vec<PendingBatch<E>>>>,
    metrics: Arc<ProviderMetrics>,
    rx: mpsc::Receiver<Command>,
    poll_interval: Duration,
}

impl<E: TraceEvent> Worker<E> {
    fn run(&mut self) {
        loop {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Ok(Command::Poll) | Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            while let Some(batch) = self.take_due(false) {
                self.execute(&batch);
            }
        }

        // Whatever never fired still has to complete.
        let leftover: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for batch in leftover {
            tracing::debug!(id = %batch.composite.id(), "cancelling batch on shutdown");
            batch.composite.cancel();
        }
    }

    /// Pops one due batch, preferring foreground over background.
    fn take_due(&self, foreground_only: bool) -> Option<Arc<CoalescedRequest<E>>> {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();
        let position = |priority: RequestPriority| {
            pending
                .iter()
                .position(|b| b.fire_at <= now && b.composite.priority() == priority)
        };
        let index = match position(RequestPriority::Foreground) {
            Some(i) => Some(i),
            None if foreground_only => None,
            None => position(RequestPriority::Background),
        };
        index.map(|i| pending.remove(i).composite)
    }

    fn execute(&mut self, composite: &Arc<CoalescedRequest<E>>) {
        self.metrics.batches_fired.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            id = %composite.id(),
            children = composite.child_count(),
            priority = ?composite.priority(),
            "executing batch"
        );
        composite.start();

        let start = composite.start_index();
        let end = start.saturating_add(composite.nb_requested());
        let is_background = composite.priority() == RequestPriority::Background;
        let block_size = composite.block_size() as u64;

        let mut rank = start;
        let mut since_yield = 0u64;
        while rank < end {
            if composite.is_cancelled() {
                // Either an external cancel on the composite or every child
                // individually cancelled; finalize its own state machine.
                composite.cancel();
                return;
            }
            match self.source.next_event(rank) {
                Err(err) => {
                    self.metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(id = %composite.id(), %err, "batch failed");
                    composite.fail_with(err.to_string());
                    return;
                }
                Ok(None) => break,
                Ok(Some(event)) => {
                    if composite.matches(&event) {
                        composite.accept(Some(&event));
                        self.metrics.events_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    rank += 1;
                    since_yield += 1;
                    // A background batch lets due foreground work cut in
                    // between delivery chunks. Foreground batches executed
                    // here never yield themselves, so this cannot recurse
                    // further than one level.
                    if is_background && since_yield >= block_size {
                        since_yield = 0;
                        while let Some(urgent) = self.take_due(true) {
                            self.execute(&urgent);
                        }
                    }
                }
            }
        }

        composite.accept(None);
        composite.complete();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
