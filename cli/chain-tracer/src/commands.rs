mod follow;
mod replay;

pub(crate) mod runner;

use std::{path::Path, sync::Arc};

use market_chainstate::{
    recorded::RecordedChain, ChainState, ChangeHandlerMux, PeriodMonitor, PeriodReport,
    ProofOracle,
};

pub(crate) use follow::FollowCommand;
pub(crate) use replay::ReplayCommand;

use crate::{
    cli::CliError,
    handlers::{ChangeCounter, LoggingHandler},
};

/// Loads `input` and builds a state tracking it from its first block, with period reporting.
fn recorded_chain_state(
    input: &Path,
    counter: &ChangeCounter,
) -> Result<(Arc<RecordedChain>, ChainState<Arc<RecordedChain>>), CliError> {
    let chain = Arc::new(RecordedChain::load(input)?);
    tracing::info!(
        input = %input.display(),
        from = %chain.time_range().from(),
        to = %chain.time_range().to(),
        "loaded recording"
    );

    let oracle: Arc<dyn ProofOracle> = chain.clone();
    let handlers = ChangeHandlerMux::new()
        .with(LoggingHandler)
        .with(counter.clone());
    let state = ChainState::new(chain.clone(), handlers, chain.start())
        .with_period_monitor(PeriodMonitor::new(oracle));

    Ok((chain, state))
}

/// Prints every report as a single JSON line.
fn print_reports(reports: &[PeriodReport]) -> Result<(), CliError> {
    for report in reports {
        println!("{}", serde_json::to_string(report)?);
    }
    Ok(())
}
