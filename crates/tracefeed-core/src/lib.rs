//! # `TraceFeed` Core
//!
//! The trace event fetch model: asynchronous, cancellable, priority-aware
//! requests over large event streams.
//!
//! This crate provides:
//! - **Requests**: a monotonic `Pending → Running → Completed` state machine
//!   with success, failure, and cancellation outcomes
//! - **Filters**: composable acceptance predicates over rank, time range,
//!   event kind, and source
//! - **Coalescing**: composite requests that broadcast one shared fetch to
//!   many consumers, each with its own filters and completion
//! - **Provider**: an execution engine that batches compatible requests and
//!   schedules foreground work ahead of background work
//!
//! ## Example
//!
//! ```rust,ignore
//! use tracefeed_core::{EventProvider, EventRequest};
//!
//! let provider = EventProvider::new(source);
//! let request = Arc::new(EventRequest::for_block(0, 1000));
//! provider.submit(&request)?;
//! request.wait_for_completion();
//! assert!(request.succeeded());
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod coalesce;
pub mod event;
pub mod filter;
pub mod latch;
pub mod provider;
pub mod request;
pub mod time;

// Re-export key types
pub use coalesce::CoalescedRequest;
pub use event::{EventKind, SourceId, TraceEvent};
pub use filter::{EventFilter, FilterSet, ALL_EVENTS};
pub use latch::WaitError;
pub use provider::{EventProvider, EventSource, ProviderConfig, ProviderError};
pub use request::{
    EventRequest, RequestId, RequestObserver, RequestOutcome, RequestPriority, RequestState,
};
pub use time::{TimeRange, Timestamp};

/// Result type for tracefeed-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tracefeed-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A bounded wait expired before the transition occurred
    #[error("Wait error: {0}")]
    Wait(#[from] latch::WaitError),

    /// Provider or event source errors
    #[error("Provider error: {0}")]
    Provider(#[from] provider::ProviderError),
}
