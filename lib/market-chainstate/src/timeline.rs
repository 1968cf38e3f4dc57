use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{
    events::{BlockSpan, ChainEvent, ChainEvents},
    interpolator::{InterpolatorError, TimestampInterpolator},
    types::{BlockNumber, TimeRange},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("timeline starts at {start}, before the high-water mark {high_water_mark}")]
    StartsBeforeHighWaterMark {
        start: DateTime<Utc>,
        high_water_mark: DateTime<Utc>,
    },

    #[error("blocks {span:?} are not inside the requested range {requested}")]
    SpanOutsideRange {
        span: BlockSpan,
        requested: TimeRange,
    },

    #[error("event in block {block} was returned without any block span")]
    EventWithoutSpan { block: BlockNumber },

    #[error(transparent)]
    EventOutsideInterval(#[from] InterpolatorError),
}

/// One block of the timeline, with the events it emitted in application order.
#[derive(Debug, PartialEq, Eq)]
pub struct TimelineBlock<'a> {
    pub number: BlockNumber,
    pub timestamp: DateTime<Utc>,
    pub events: &'a [ChainEvent],
}

/// Block-ordered merge of everything returned by a single fetch.
#[derive(Debug)]
pub struct ChainEventTimeline {
    requested: TimeRange,
    interpolator: Option<TimestampInterpolator>,
    /// Only blocks with events are stored, empty blocks are produced while iterating.
    events: BTreeMap<BlockNumber, Vec<ChainEvent>>,
}

impl ChainEventTimeline {
    /// Merges the typed event streams of a fetch into a single timeline.
    ///
    /// Fails when the fetch starts before `high_water_mark`: replaying a range twice would
    /// apply its events twice, so it is always a bug in the caller.
    pub fn build(
        events: ChainEvents,
        high_water_mark: Option<DateTime<Utc>>,
    ) -> Result<Self, TimelineError> {
        let requested = events.requested;
        if let Some(high_water_mark) = high_water_mark {
            if requested.from() < high_water_mark {
                return Err(TimelineError::StartsBeforeHighWaterMark {
                    start: requested.from(),
                    high_water_mark,
                });
            }
        }

        let span = events.span;
        if let Some(span) = span {
            // The fetched range is half-open, the first block must be strictly after its start
            if span.times.from() <= requested.from() || span.times.to() > requested.to() {
                return Err(TimelineError::SpanOutsideRange { span, requested });
            }
        }
        let interpolator = span.map(|span| TimestampInterpolator::new(span.blocks, span.times));

        let mut by_block = BTreeMap::<BlockNumber, Vec<ChainEvent>>::new();
        for event in events.into_events() {
            let block = event.block();
            match &interpolator {
                Some(interpolator) => {
                    // Only used to validate the block number
                    interpolator.timestamp(block)?;
                }
                None => return Err(TimelineError::EventWithoutSpan { block }),
            }
            by_block.entry(block).or_default().push(event);
        }
        for block_events in by_block.values_mut() {
            // Stable, so same-kind events keep the order they were fetched in
            block_events.sort_by_key(ChainEvent::kind);
        }

        Ok(Self {
            requested,
            interpolator,
            events: by_block,
        })
    }

    pub fn requested(&self) -> TimeRange {
        self.requested
    }

    pub fn span(&self) -> Option<BlockSpan> {
        self.interpolator.map(|interpolator| BlockSpan {
            blocks: interpolator.blocks(),
            times: interpolator.times(),
        })
    }

    pub fn last_block(&self) -> Option<BlockNumber> {
        self.interpolator
            .map(|interpolator| interpolator.blocks().to())
    }

    pub fn event_count(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    /// Iterates every block of the span in ascending order, including blocks without events.
    pub fn blocks(&self) -> impl Iterator<Item = TimelineBlock<'_>> + Send + '_ {
        self.interpolator.into_iter().flat_map(move |interpolator| {
            let interval = interpolator.blocks();
            (interval.from()..=interval.to()).filter_map(move |number| {
                let timestamp = interpolator.timestamp(number).ok()?;
                let events = self
                    .events
                    .get(&number)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                Some(TimelineBlock {
                    number,
                    timestamp,
                    events,
                })
            })
        })
    }
}
