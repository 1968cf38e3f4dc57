use clap::Parser;
use market_chainstate::{recorded::RecordedChainError, ChainStateError};

use crate::commands::{FollowCommand, ReplayCommand};

/// Replays storage marketplace events from a chain recording, tracking every request and
/// reporting missed storage proofs.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub subcommand: SubCommand,
}

/// Supported sub-commands.
#[derive(Debug, clap::Subcommand, Clone)]
pub(crate) enum SubCommand {
    /// Replay a recording in fixed steps and print the resulting state
    Replay(ReplayCommand),
    /// Keep a recording's state up to date with the wall clock until interrupted
    Follow(FollowCommand),
}

/// CLI components error handling implementor.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error("FromEnv error: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::FromEnvError),

    #[error("the replay step must be at least one second")]
    ZeroStep,

    #[error("{0} seconds is out of range")]
    DurationOutOfRange(u64),

    #[error(transparent)]
    Recording(#[from] RecordedChainError),

    #[error(transparent)]
    ChainState(#[from] ChainStateError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
