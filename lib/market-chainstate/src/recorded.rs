//! Chain history loaded from a JSON recording.
//!
//! A recording holds the blocks of a chain segment with their timestamps, the marketplace
//! events they emitted and the proof requirements read back for every slot and period. It
//! stands in for a live node when replaying a known history, both as a
//! [`ChainEventFetcher`] and as a [`ProofOracle`].
//!
//! Blocks left out of a recording get interpolated timestamps during the replay, like any
//! block inside a fetched span, so recordings should list every block when block times vary.

use std::{
    collections::{BTreeSet, HashMap},
    io::Read,
    path::Path,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    events::{BlockSpan, ChainEvent, ChainEvents},
    fetcher::{ChainEventFetcher, FetchError},
    period::{OracleError, ProofOracle, ProofState},
    types::{
        BlockInterval, BlockNumber, PeriodNumber, RangeError, RequestId, StorageRequest, TimeRange,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum RecordedChainError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("proof period length must be greater than zero")]
    ZeroPeriod,

    #[error("recording contains no blocks")]
    NoBlocks,

    #[error("block {block} follows block {previous}, block numbers must strictly increase")]
    UnorderedBlocks {
        previous: BlockNumber,
        block: BlockNumber,
    },

    #[error("block {block} is older than the block before it")]
    TimestampWentBackwards { block: BlockNumber },

    #[error("event references block {0}, which is not part of the recording")]
    UnknownBlock(BlockNumber),

    #[error(transparent)]
    Range(#[from] RangeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedBlock {
    pub number: BlockNumber,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedProof {
    pub request_id: RequestId,
    pub slot_index: u64,
    pub period: PeriodNumber,
    #[serde(flatten)]
    pub state: ProofState,
}

/// On-disk layout of a recording.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecording {
    /// Length of a proof period, in seconds.
    pub period_seconds: u64,
    pub blocks: Vec<RecordedBlock>,
    #[serde(default)]
    pub events: Vec<ChainEvent>,
    /// Slots and periods missing from this list did not require a proof.
    #[serde(default)]
    pub proofs: Vec<RecordedProof>,
}

/// A validated [`ChainRecording`].
#[derive(Debug)]
pub struct RecordedChain {
    recording: ChainRecording,
    time_range: TimeRange,
    proofs: HashMap<(RequestId, u64, PeriodNumber), ProofState>,
}

impl TryFrom<ChainRecording> for RecordedChain {
    type Error = RecordedChainError;

    fn try_from(recording: ChainRecording) -> Result<Self, Self::Error> {
        if recording.period_seconds == 0 {
            return Err(RecordedChainError::ZeroPeriod);
        }
        let (Some(first), Some(last)) = (recording.blocks.first(), recording.blocks.last()) else {
            return Err(RecordedChainError::NoBlocks);
        };
        for pair in recording.blocks.windows(2) {
            let (previous, block) = (&pair[0], &pair[1]);
            if block.number <= previous.number {
                return Err(RecordedChainError::UnorderedBlocks {
                    previous: previous.number,
                    block: block.number,
                });
            }
            if block.timestamp < previous.timestamp {
                return Err(RecordedChainError::TimestampWentBackwards {
                    block: block.number,
                });
            }
        }

        let time_range = TimeRange::new(first.timestamp, last.timestamp)?;

        let known = recording
            .blocks
            .iter()
            .map(|block| block.number)
            .collect::<BTreeSet<_>>();
        if let Some(event) = recording
            .events
            .iter()
            .find(|event| !known.contains(&event.block()))
        {
            return Err(RecordedChainError::UnknownBlock(event.block()));
        }

        let proofs = recording
            .proofs
            .iter()
            .map(|proof| ((proof.request_id, proof.slot_index, proof.period), proof.state))
            .collect();

        tracing::debug!(
            blocks = recording.blocks.len(),
            events = recording.events.len(),
            proofs = recording.proofs.len(),
            "loaded chain recording"
        );
        Ok(Self {
            recording,
            time_range,
            proofs,
        })
    }
}

impl RecordedChain {
    pub fn load<P>(path: P) -> Result<Self, RecordedChainError>
    where
        P: AsRef<Path>,
    {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn from_reader<R>(reader: R) -> Result<Self, RecordedChainError>
    where
        R: Read,
    {
        let recording: ChainRecording = serde_json::from_reader(reader)?;
        Self::try_from(recording)
    }

    pub fn recording(&self) -> &ChainRecording {
        &self.recording
    }

    /// Time covered by the recording, from its first to its last block.
    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    /// Moment right before the first recorded block, to start a replay from.
    pub fn start(&self) -> DateTime<Utc> {
        let first = self.time_range.from();
        first
            .checked_sub_signed(TimeDelta::milliseconds(1))
            .unwrap_or(first)
    }
}

#[async_trait]
impl ChainEventFetcher for RecordedChain {
    async fn fetch_events(&self, range: TimeRange) -> Result<ChainEvents, FetchError> {
        let blocks = &self.recording.blocks;
        let start = blocks.partition_point(|block| block.timestamp <= range.from());
        let end = blocks.partition_point(|block| block.timestamp <= range.to());
        if start >= end {
            return Ok(ChainEvents::empty(range));
        }
        let (first, last) = (&blocks[start], &blocks[end - 1]);

        let span = BlockSpan {
            blocks: BlockInterval::new(first.number, last.number)
                .map_err(|err| FetchError::Decode(err.to_string()))?,
            times: TimeRange::new(first.timestamp, last.timestamp)
                .map_err(|err| FetchError::Decode(err.to_string()))?,
        };
        let events = self
            .recording
            .events
            .iter()
            .filter(|event| span.blocks.contains(event.block()))
            .cloned();

        Ok(ChainEvents::from_events(range, Some(span), events))
    }
}

#[async_trait]
impl ProofOracle for RecordedChain {
    async fn period_number(&self, utc: DateTime<Utc>) -> Result<PeriodNumber, OracleError> {
        let seconds = u64::try_from(utc.timestamp()).map_err(|_| {
            OracleError::InvalidConfiguration(format!("{utc} is before the unix epoch"))
        })?;
        Ok(seconds / self.recording.period_seconds)
    }

    async fn proof_state(
        &self,
        request: &StorageRequest,
        slot_index: u64,
        _reference_block: BlockNumber,
        period: PeriodNumber,
    ) -> Result<ProofState, OracleError> {
        Ok(self
            .proofs
            .get(&(request.id, slot_index, period))
            .copied()
            .unwrap_or_default())
    }
}
