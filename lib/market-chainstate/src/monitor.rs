//! Polling loop keeping a [`ChainState`] close to the chain head.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    chain_state::{ChainState, ChainStateError},
    fetcher::ChainEventFetcher,
    period::PeriodReport,
};

/// Default time between two updates.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default distance kept from the wall clock, so that only settled blocks are replayed.
pub const DEFAULT_FINALITY_LAG: TimeDelta = TimeDelta::seconds(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub finality_lag: TimeDelta,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            finality_lag: DEFAULT_FINALITY_LAG,
        }
    }
}

impl MonitorConfig {
    /// Target of the next update, `finality_lag` behind `now`.
    pub fn target(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.finality_lag)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Updates `state` every `poll_interval` until `token` is cancelled.
///
/// Recoverable errors are logged and retried on the next tick, since a failed update leaves
/// the state untouched. Any other error stops the loop. Period reports are drained after
/// every tick and handed to `on_reports`.
pub async fn run_chain_monitor<F, R>(
    state: &mut ChainState<F>,
    config: MonitorConfig,
    token: CancellationToken,
    mut on_reports: R,
) -> Result<(), ChainStateError>
where
    F: ChainEventFetcher,
    R: FnMut(Vec<PeriodReport>) + Send,
{
    tracing::info!(
        poll_interval = ?config.poll_interval,
        finality_lag = %config.finality_lag,
        "starting chain monitor"
    );

    loop {
        let target = config.target(Utc::now());
        if target > state.high_water_mark() {
            match state.update(target).await {
                Ok(summary) => tracing::debug!(
                    events = summary.events,
                    changes = summary.changes,
                    "tick"
                ),
                Err(err) if err.is_recoverable() => {
                    tracing::warn!(%err, "chain state update failed, retrying on the next tick");
                }
                Err(err) => {
                    tracing::error!(%err, "chain state update failed");
                    return Err(err);
                }
            }
        }

        if let Some(monitor) = state.period_monitor() {
            let reports = monitor.get_and_clear_reports().await;
            if !reports.is_empty() {
                on_reports(reports);
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("chain monitor stopped by the cancellation token");
                return Ok(());
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}
