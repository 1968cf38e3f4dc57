use async_trait::async_trait;

use crate::{events::ChainEvents, types::TimeRange};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The node could not be reached or did not answer in time.
    #[error("chain node unavailable: {0}")]
    Unavailable(String),

    /// The node answered with something that could not be decoded.
    #[error("failed to decode chain events: {0}")]
    Decode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Source of decoded marketplace events, usually backed by a chain RPC client.
///
/// Implementations own the RPC calls, decoding and any retry policy; the chain state only
/// ever asks for consecutive, non-overlapping ranges.
#[async_trait]
pub trait ChainEventFetcher: Send + Sync {
    /// Returns every event emitted by blocks whose timestamp lies in
    /// `(range.from, range.to]`, along with the span of those blocks.
    async fn fetch_events(&self, range: TimeRange) -> Result<ChainEvents, FetchError>;
}

#[async_trait]
impl<F> ChainEventFetcher for std::sync::Arc<F>
where
    F: ChainEventFetcher + ?Sized,
{
    async fn fetch_events(&self, range: TimeRange) -> Result<ChainEvents, FetchError> {
        (**self).fetch_events(range).await
    }
}
