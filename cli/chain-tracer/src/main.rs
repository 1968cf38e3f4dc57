//! A CLI application replaying recorded storage marketplace histories.
#![deny(unused_crate_dependencies)]
#![deny(clippy::unwrap_used)]

mod cli;
pub(crate) mod commands;
mod handlers;

pub(crate) use cli::Cli;
use cli::CliError;
use commands::runner;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    // Logs go to stderr, stdout carries the JSON output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .init();

    runner::run().await
}
