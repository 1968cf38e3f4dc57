use std::{path::PathBuf, time::Duration};

use chrono::TimeDelta;
use clap::Args;
use market_chainstate::monitor::{run_chain_monitor, MonitorConfig};
use tokio_util::sync::CancellationToken;

use super::{print_reports, recorded_chain_state};
use crate::{cli::CliError, handlers::ChangeCounter};

/// Follow arguments, as passed by the user, unvalidated.
#[derive(Debug, Clone, Args)]
pub(crate) struct FollowCommand {
    /// Chain recording to follow, as JSON.
    #[arg(long)]
    input: PathBuf,

    /// Time between two updates, in seconds.
    #[arg(long, default_value_t = 10)]
    poll_interval_seconds: u64,

    /// Distance kept from the wall clock, in seconds.
    #[arg(long, default_value_t = 60)]
    finality_lag_seconds: u64,
}

/// Validated follow configuration.
#[derive(Debug)]
struct FollowConfiguration {
    input: PathBuf,
    monitor: MonitorConfig,
}

impl TryFrom<FollowCommand> for FollowConfiguration {
    type Error = CliError;

    fn try_from(value: FollowCommand) -> Result<Self, Self::Error> {
        let finality_lag = i64::try_from(value.finality_lag_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or(CliError::DurationOutOfRange(value.finality_lag_seconds))?;

        Ok(Self {
            input: value.input,
            monitor: MonitorConfig {
                poll_interval: Duration::from_secs(value.poll_interval_seconds),
                finality_lag,
            },
        })
    }
}

impl FollowCommand {
    pub(crate) async fn run(&self) -> Result<(), CliError> {
        let configuration = FollowConfiguration::try_from(self.clone())?;

        let counter = ChangeCounter::default();
        let (_, mut state) = recorded_chain_state(&configuration.input, &counter)?;

        let token = CancellationToken::new();
        let ctrl_c_token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "failed to listen for ctrl-c");
            }
            tracing::info!("received ctrl-c, shutting down");
            ctrl_c_token.cancel();
        });

        let mut print_failure = None;
        run_chain_monitor(&mut state, configuration.monitor, token, |reports| {
            if let Err(err) = print_reports(&reports) {
                tracing::error!(%err, "failed to print period reports");
                print_failure.get_or_insert(err);
            }
        })
        .await?;

        tracing::info!(changes = ?counter.snapshot(), "follow stopped");
        match print_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
