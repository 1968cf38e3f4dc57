//! Per-period storage proof reporting.
//!
//! Whether a slot must be proven in a given period is decided pseudo-randomly by the
//! marketplace contract, keyed by the slot identity and the period. The decision, and
//! whether the proof went missing, can only be read back once the period is over, so the
//! [`PeriodMonitor`] builds its reports retrospectively, when it observes the first block
//! of the next period.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    registry::TrackedRequest,
    types::{Address, BlockNumber, PeriodNumber, RequestId, RequestState, StorageRequest},
};

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("proof oracle unavailable: {0}")]
    Unavailable(String),

    #[error("proof period configuration is invalid: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Proof requirement of one slot in one period.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofState {
    /// A proof had to be submitted for the slot during the period.
    pub required: bool,
    /// The required proof was never submitted.
    pub missing: bool,
}

/// On-chain source of period boundaries and proof requirements.
#[async_trait]
pub trait ProofOracle: Send + Sync {
    /// Maps a timestamp to its proof period, using the contract's period length.
    async fn period_number(&self, utc: DateTime<Utc>) -> Result<PeriodNumber, OracleError>;

    /// Reads whether `slot_index` of `request` required a proof during `period`, and whether
    /// that proof is missing, as seen at `reference_block`.
    async fn proof_state(
        &self,
        request: &StorageRequest,
        slot_index: u64,
        reference_block: BlockNumber,
        period: PeriodNumber,
    ) -> Result<ProofState, OracleError>;
}

/// A required proof that was never submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MissedProof {
    /// Host storing the slot when the report was built, if any.
    pub host: Option<Address>,
    pub request_id: RequestId,
    pub slot_index: u64,
}

/// Summary of a finished proof period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeriodReport {
    pub period_number: PeriodNumber,
    /// Block the proof states were read at, the last block observed in the period.
    pub reference_block: BlockNumber,
    /// Number of slots examined.
    pub total_slots: u64,
    /// Number of slots for which a proof was required.
    pub required_proofs: u64,
    pub missed_proofs: Vec<MissedProof>,
}

/// Queue of finished reports, shared between the producing replay and a draining consumer.
#[derive(Clone, Debug, Default)]
pub struct ReportQueue {
    inner: Arc<Mutex<Vec<PeriodReport>>>,
}

impl ReportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn push_all(&self, reports: Vec<PeriodReport>) {
        if reports.is_empty() {
            return;
        }
        self.inner.lock().await.extend(reports);
    }

    /// Takes every queued report, oldest first, leaving the queue empty.
    pub async fn get_and_clear(&self) -> Vec<PeriodReport> {
        std::mem::take(&mut *self.inner.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Most periods closed by a single rollover before older ones are dropped.
pub const DEFAULT_MAX_CLOSED_PERIODS: u64 = 1_000;

/// Position of the monitor: the current period and the last block seen inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeriodCursor {
    pub period: PeriodNumber,
    pub last_block: BlockNumber,
    pub last_timestamp: DateTime<Utc>,
}

/// Detects period rollovers and reports the proofs required and missed in every period.
pub struct PeriodMonitor {
    oracle: Arc<dyn ProofOracle>,
    cursor: Option<PeriodCursor>,
    reports: ReportQueue,
    max_closed_periods: u64,
}

impl PeriodMonitor {
    pub fn new(oracle: Arc<dyn ProofOracle>) -> Self {
        Self {
            oracle,
            cursor: None,
            reports: ReportQueue::new(),
            max_closed_periods: DEFAULT_MAX_CLOSED_PERIODS,
        }
    }

    /// Limits how many periods a single rollover reports. When more periods went by
    /// without a block, only the most recent ones are reported.
    pub fn with_max_closed_periods(mut self, max_closed_periods: u64) -> Self {
        self.max_closed_periods = max_closed_periods.max(1);
        self
    }

    pub fn current_period(&self) -> Option<PeriodNumber> {
        self.cursor.map(|cursor| cursor.period)
    }

    pub fn cursor(&self) -> Option<PeriodCursor> {
        self.cursor
    }

    /// Handle to the pending reports, for consumers living on another task.
    pub fn reports(&self) -> ReportQueue {
        self.reports.clone()
    }

    /// Returns and empties the pending reports.
    pub async fn get_and_clear_reports(&self) -> Vec<PeriodReport> {
        self.reports.get_and_clear().await
    }

    /// Observes a processed block, queueing a report for every period that ended before it.
    ///
    /// `requests` is the full set of tracked requests; only the ones still running at the
    /// reference block, the last block of the closed period, are examined. On error the monitor is left untouched and the same block can
    /// be observed again.
    pub async fn observe<'a, I>(
        &mut self,
        block: BlockNumber,
        utc: DateTime<Utc>,
        requests: I,
    ) -> Result<(), OracleError>
    where
        I: IntoIterator<Item = &'a TrackedRequest> + Send,
        I::IntoIter: Send,
    {
        let mut cursor = self.cursor;
        let reports = self.step(&mut cursor, block, utc, requests).await?;
        self.commit(cursor, reports).await;
        Ok(())
    }

    /// Stores the outcome of one or more successful [`PeriodMonitor::step`] calls.
    pub(crate) async fn commit(&mut self, cursor: Option<PeriodCursor>, reports: Vec<PeriodReport>) {
        self.cursor = cursor;
        self.reports.push_all(reports).await;
    }

    /// Advances `cursor` to `block`, returning the reports of the periods it closed.
    ///
    /// `cursor` is only written on success.
    pub(crate) async fn step<'a, I>(
        &self,
        cursor: &mut Option<PeriodCursor>,
        block: BlockNumber,
        utc: DateTime<Utc>,
        requests: I,
    ) -> Result<Vec<PeriodReport>, OracleError>
    where
        I: IntoIterator<Item = &'a TrackedRequest> + Send,
        I::IntoIter: Send,
    {
        let period = self.oracle.period_number(utc).await?;

        let current = match *cursor {
            None => {
                tracing::debug!(period, block, "first observed period");
                *cursor = Some(PeriodCursor {
                    period,
                    last_block: block,
                    last_timestamp: utc,
                });
                return Ok(Vec::new());
            }
            Some(current) => current,
        };

        if period <= current.period {
            if period < current.period {
                tracing::warn!(
                    period,
                    current = current.period,
                    block,
                    "period went backwards, ignoring"
                );
            }
            *cursor = Some(PeriodCursor {
                last_block: block,
                last_timestamp: utc,
                ..current
            });
            return Ok(Vec::new());
        }

        // A request may have finished after the reference block but before this one
        let active = requests
            .into_iter()
            .filter(|tracked| {
                matches!(tracked.state, RequestState::Started | RequestState::Finished)
                    && tracked.finish_time() > current.last_timestamp
            })
            .collect::<Vec<_>>();

        let mut first_closed = current.period;
        if period - current.period > self.max_closed_periods {
            first_closed = period - self.max_closed_periods;
            tracing::warn!(
                from = current.period,
                to = first_closed,
                block,
                "too many periods without a block, dropping the oldest reports"
            );
        }

        let mut reports = Vec::new();
        // Periods without any block are closed with the same reference block
        for closed in first_closed..period {
            reports.push(
                self.build_report(closed, current.last_block, &active)
                    .await?,
            );
        }

        *cursor = Some(PeriodCursor {
            period,
            last_block: block,
            last_timestamp: utc,
        });
        Ok(reports)
    }

    #[tracing::instrument(skip(self, active), fields(active = active.len()))]
    async fn build_report(
        &self,
        period: PeriodNumber,
        reference_block: BlockNumber,
        active: &[&TrackedRequest],
    ) -> Result<PeriodReport, OracleError> {
        let mut report = PeriodReport {
            period_number: period,
            reference_block,
            total_slots: 0,
            required_proofs: 0,
            missed_proofs: Vec::new(),
        };

        for tracked in active {
            for slot_index in 0..tracked.request.ask.slots {
                report.total_slots += 1;
                let state = self
                    .oracle
                    .proof_state(&tracked.request, slot_index, reference_block, period)
                    .await?;
                if !state.required {
                    continue;
                }
                report.required_proofs += 1;
                if state.missing {
                    report.missed_proofs.push(MissedProof {
                        host: tracked.hosts.host(slot_index).copied(),
                        request_id: tracked.request.id,
                        slot_index,
                    });
                }
            }
        }

        tracing::info!(
            period,
            total = report.total_slots,
            required = report.required_proofs,
            missed = report.missed_proofs.len(),
            "period report"
        );
        Ok(report)
    }
}
