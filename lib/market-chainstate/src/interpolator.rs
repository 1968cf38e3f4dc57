use chrono::{DateTime, TimeDelta, Utc};

use crate::types::{BlockInterval, BlockNumber, TimeRange};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InterpolatorError {
    #[error("block {block} is outside of {interval}")]
    OutOfRange {
        block: BlockNumber,
        interval: BlockInterval,
    },
}

/// Estimates block timestamps from the exact timestamps of an interval's boundaries.
///
/// Block production is assumed to be evenly spaced, which is good enough for period and
/// expiry bookkeeping but not for anything requiring exact timing. The estimate is exact for
/// the first and last block, and never decreases as the block number grows.
#[derive(Clone, Copy, Debug)]
pub struct TimestampInterpolator {
    blocks: BlockInterval,
    times: TimeRange,
    /// Whole range duration, in milliseconds.
    duration_ms: i128,
}

impl TimestampInterpolator {
    pub fn new(blocks: BlockInterval, times: TimeRange) -> Self {
        Self {
            blocks,
            times,
            duration_ms: i128::from(times.duration().num_milliseconds()),
        }
    }

    pub fn blocks(&self) -> BlockInterval {
        self.blocks
    }

    pub fn times(&self) -> TimeRange {
        self.times
    }

    /// Returns the estimated timestamp for `block`.
    pub fn timestamp(&self, block: BlockNumber) -> Result<DateTime<Utc>, InterpolatorError> {
        if !self.blocks.contains(block) {
            return Err(InterpolatorError::OutOfRange {
                block,
                interval: self.blocks,
            });
        }
        if block == self.blocks.to() {
            return Ok(self.times.to());
        }

        // The gaps between blocks split the range; a single block interval has no gap and
        // was already handled above.
        let gaps = i128::from(self.blocks.number_of_blocks() - 1);
        let offset = i128::from(block - self.blocks.from());
        // PRE-COND: offset < gaps, so the result is smaller than the range duration,
        // which fits an i64 of milliseconds
        let offset_ms = (self.duration_ms * offset / gaps) as i64;

        Ok(self.times.from() + TimeDelta::milliseconds(offset_ms))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(seconds, 0).unwrap()
    }

    fn interpolator(from: u64, to: u64, start: i64, end: i64) -> TimestampInterpolator {
        TimestampInterpolator::new(
            BlockInterval::new(from, to).unwrap(),
            TimeRange::new(at(start), at(end)).unwrap(),
        )
    }

    #[rstest]
    #[case(100, 1000)]
    #[case(101, 1010)]
    #[case(105, 1050)]
    #[case(110, 1100)]
    fn evenly_spaced_blocks(#[case] block: u64, #[case] expected: i64) {
        let interpolator = interpolator(100, 110, 1000, 1100);
        assert_eq!(interpolator.timestamp(block).unwrap(), at(expected));
    }

    #[test]
    fn exact_at_both_endpoints() {
        // 7 seconds over 3 gaps does not divide evenly
        let interpolator = interpolator(10, 13, 500, 507);
        assert_eq!(interpolator.timestamp(10).unwrap(), at(500));
        assert_eq!(interpolator.timestamp(13).unwrap(), at(507));
    }

    #[test]
    fn non_decreasing_over_the_interval() {
        let interpolator = interpolator(1_000, 1_997, 20_000, 20_013);
        let timestamps = (1_000..=1_997)
            .map(|block| interpolator.timestamp(block).unwrap())
            .collect::<Vec<_>>();
        assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(timestamps.first(), Some(&at(20_000)));
        assert_eq!(timestamps.last(), Some(&at(20_013)));
    }

    #[test]
    fn single_block_interval() {
        let interpolator = interpolator(42, 42, 900, 900);
        assert_eq!(interpolator.timestamp(42).unwrap(), at(900));
    }

    #[rstest]
    #[case(99)]
    #[case(111)]
    fn rejects_blocks_outside_the_interval(#[case] block: u64) {
        let interpolator = interpolator(100, 110, 1000, 1100);
        assert!(matches!(
            interpolator.timestamp(block),
            Err(InterpolatorError::OutOfRange { .. })
        ));
    }
}
