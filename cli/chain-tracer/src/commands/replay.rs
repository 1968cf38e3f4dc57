use std::path::PathBuf;

use chrono::TimeDelta;
use clap::Args;
use market_chainstate::RequestView;
use serde::Serialize;

use super::{print_reports, recorded_chain_state};
use crate::{
    cli::CliError,
    handlers::{ChangeCount, ChangeCounter},
};

/// Default replay step.
const DEFAULT_STEP_SECONDS: u64 = 60;

/// Replay arguments, as passed by the user, unvalidated.
#[derive(Debug, Clone, Args)]
pub(crate) struct ReplayCommand {
    /// Chain recording to replay, as JSON.
    #[arg(long)]
    input: PathBuf,

    /// Time covered by every update, in seconds.
    #[arg(long, default_value_t = DEFAULT_STEP_SECONDS)]
    step_seconds: u64,
}

/// Validated replay configuration.
#[derive(Debug)]
struct ReplayConfiguration {
    input: PathBuf,
    step: TimeDelta,
}

impl TryFrom<ReplayCommand> for ReplayConfiguration {
    type Error = CliError;

    fn try_from(value: ReplayCommand) -> Result<Self, Self::Error> {
        if value.step_seconds == 0 {
            return Err(CliError::ZeroStep);
        }
        let step = i64::try_from(value.step_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or(CliError::DurationOutOfRange(value.step_seconds))?;

        Ok(Self {
            input: value.input,
            step,
        })
    }
}

/// Final output of a replay.
#[derive(Debug, Serialize)]
struct ReplaySummary {
    updates: u64,
    latest_block: Option<u64>,
    changes: ChangeCount,
    requests: Vec<RequestView>,
}

impl ReplayCommand {
    pub(crate) async fn run(&self) -> Result<(), CliError> {
        let configuration = ReplayConfiguration::try_from(self.clone())?;

        let counter = ChangeCounter::default();
        let (chain, mut state) = recorded_chain_state(&configuration.input, &counter)?;
        let end = chain.time_range().to();

        let mut updates = 0;
        while state.high_water_mark() < end {
            let target = state
                .high_water_mark()
                .checked_add_signed(configuration.step)
                .map_or(end, |target| target.min(end));
            state.update(target).await?;
            updates += 1;

            if let Some(monitor) = state.period_monitor() {
                print_reports(&monitor.get_and_clear_reports().await)?;
            }
        }

        let summary = ReplaySummary {
            updates,
            latest_block: state.latest_block(),
            changes: counter.snapshot(),
            requests: state.requests(),
        };
        tracing::info!(
            updates,
            requests = summary.requests.len(),
            "replay complete"
        );
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }
}
