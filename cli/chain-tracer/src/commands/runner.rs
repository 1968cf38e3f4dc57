use clap::Parser;

use crate::{
    cli::{CliError, SubCommand},
    Cli,
};

/// Parses command line arguments and runs the specified command.
pub(crate) async fn run() -> Result<(), CliError> {
    let cli_arguments: Cli = Cli::parse();

    match cli_arguments.subcommand {
        SubCommand::Replay(cmd) => cmd.run().await,
        SubCommand::Follow(cmd) => cmd.run().await,
    }
}
