//! Storage marketplace state tracking.
//!
//! The marketplace contract only exposes events, so the current state of every storage
//! request and slot is rebuilt by replaying them, block by block, in a deterministic order.
//! [`ChainState`] drives the replay, notifies a [`ChainStateChangeHandler`] of every
//! transition and, when configured, lets a [`PeriodMonitor`] report the storage proofs
//! required and missed in every proof period.
#![deny(clippy::unwrap_used)]

mod chain_state;
pub mod events;
mod fetcher;
mod handler;
mod interpolator;
pub mod monitor;
mod period;
pub mod recorded;
mod registry;
mod timeline;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use chain_state::{ChainState, ChainStateError, UpdateSummary};
pub use events::{ChainEvent, ChainEvents};
pub use fetcher::{ChainEventFetcher, FetchError};
pub use handler::{
    BoxedHandler, ChainStateChange, ChainStateChangeHandler, ChangeHandlerMux, HandlerResult,
    NoopHandler,
};
pub use interpolator::{InterpolatorError, TimestampInterpolator};
pub use period::{
    MissedProof, OracleError, PeriodCursor, PeriodMonitor, PeriodReport, ProofOracle, ProofState,
    ReportQueue, DEFAULT_MAX_CLOSED_PERIODS,
};
pub use registry::{
    FinishQueue, RegistryError, RequestHosts, RequestRegistry, RequestView, TrackedRequest,
};
pub use timeline::{ChainEventTimeline, TimelineBlock, TimelineError};
