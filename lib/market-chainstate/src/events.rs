//! Decoded marketplace contract events.
//!
//! Every event carries the block it was emitted in; timestamps are attached later, when the
//! events are merged into a [`ChainEventTimeline`](crate::timeline::ChainEventTimeline).

use serde::{Deserialize, Serialize};

use crate::types::{Address, BlockInterval, BlockNumber, RequestId, StorageRequest, TimeRange};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequested {
    pub block: BlockNumber,
    pub request: StorageRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFulfilled {
    pub block: BlockNumber,
    pub request_id: RequestId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCancelled {
    pub block: BlockNumber,
    pub request_id: RequestId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFailed {
    pub block: BlockNumber,
    pub request_id: RequestId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotFilled {
    pub block: BlockNumber,
    pub request_id: RequestId,
    pub slot_index: u64,
    pub host: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotFreed {
    pub block: BlockNumber,
    pub request_id: RequestId,
    pub slot_index: u64,
}

/// Application order of events sharing a block.
///
/// A request must exist before anything can reference it, so creation always comes first,
/// followed by the request-level transitions and finally the slot-level ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    StorageRequested,
    RequestFulfilled,
    RequestCancelled,
    RequestFailed,
    SlotFilled,
    SlotFreed,
}

/// One decoded contract event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainEvent {
    StorageRequested(StorageRequested),
    RequestFulfilled(RequestFulfilled),
    RequestCancelled(RequestCancelled),
    RequestFailed(RequestFailed),
    SlotFilled(SlotFilled),
    SlotFreed(SlotFreed),
}

impl ChainEvent {
    pub fn block(&self) -> BlockNumber {
        match self {
            ChainEvent::StorageRequested(e) => e.block,
            ChainEvent::RequestFulfilled(e) => e.block,
            ChainEvent::RequestCancelled(e) => e.block,
            ChainEvent::RequestFailed(e) => e.block,
            ChainEvent::SlotFilled(e) => e.block,
            ChainEvent::SlotFreed(e) => e.block,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::StorageRequested(_) => EventKind::StorageRequested,
            ChainEvent::RequestFulfilled(_) => EventKind::RequestFulfilled,
            ChainEvent::RequestCancelled(_) => EventKind::RequestCancelled,
            ChainEvent::RequestFailed(_) => EventKind::RequestFailed,
            ChainEvent::SlotFilled(_) => EventKind::SlotFilled,
            ChainEvent::SlotFreed(_) => EventKind::SlotFreed,
        }
    }
}

/// Blocks covered by a fetch, along with the exact timestamps of the first and last one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlockSpan {
    pub blocks: BlockInterval,
    pub times: TimeRange,
}

/// Result of a single [`ChainEventFetcher::fetch_events`](crate::fetcher::ChainEventFetcher::fetch_events) call.
///
/// The fetch covers the half-open range `(requested.from, requested.to]`; `span` is `None`
/// when no block was produced inside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEvents {
    pub requested: TimeRange,
    pub span: Option<BlockSpan>,
    pub new_requests: Vec<StorageRequested>,
    pub fulfilled: Vec<RequestFulfilled>,
    pub cancelled: Vec<RequestCancelled>,
    pub failed: Vec<RequestFailed>,
    pub slot_filled: Vec<SlotFilled>,
    pub slot_freed: Vec<SlotFreed>,
}

impl ChainEvents {
    /// An empty result, for ranges without any block.
    pub fn empty(requested: TimeRange) -> Self {
        Self {
            requested,
            span: None,
            new_requests: Vec::new(),
            fulfilled: Vec::new(),
            cancelled: Vec::new(),
            failed: Vec::new(),
            slot_filled: Vec::new(),
            slot_freed: Vec::new(),
        }
    }

    /// Sorts a flat list of events into their typed streams.
    pub fn from_events<I>(requested: TimeRange, span: Option<BlockSpan>, events: I) -> Self
    where
        I: IntoIterator<Item = ChainEvent>,
    {
        let mut result = Self::empty(requested);
        result.span = span;
        for event in events {
            match event {
                ChainEvent::StorageRequested(e) => result.new_requests.push(e),
                ChainEvent::RequestFulfilled(e) => result.fulfilled.push(e),
                ChainEvent::RequestCancelled(e) => result.cancelled.push(e),
                ChainEvent::RequestFailed(e) => result.failed.push(e),
                ChainEvent::SlotFilled(e) => result.slot_filled.push(e),
                ChainEvent::SlotFreed(e) => result.slot_freed.push(e),
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.new_requests.len()
            + self.fulfilled.len()
            + self.cancelled.len()
            + self.failed.len()
            + self.slot_filled.len()
            + self.slot_freed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the typed streams back into a single list, stream by stream.
    pub fn into_events(self) -> impl Iterator<Item = ChainEvent> {
        let Self {
            new_requests,
            fulfilled,
            cancelled,
            failed,
            slot_filled,
            slot_freed,
            ..
        } = self;

        new_requests
            .into_iter()
            .map(ChainEvent::StorageRequested)
            .chain(fulfilled.into_iter().map(ChainEvent::RequestFulfilled))
            .chain(cancelled.into_iter().map(ChainEvent::RequestCancelled))
            .chain(failed.into_iter().map(ChainEvent::RequestFailed))
            .chain(slot_filled.into_iter().map(ChainEvent::SlotFilled))
            .chain(slot_freed.into_iter().map(ChainEvent::SlotFreed))
    }
}
