//! Implementation-step extraction.
//!
//! A cheap phase asks the agent to distill `IMPLEMENTATION_PLAN.md` into a
//! JSON array of steps; the array is then fished out of the saved artifact
//! (agents pad their output, so the parser scans free text for the first
//! balanced array).

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::PipelineError;
use crate::orchestrator::runner::{PhaseRunner, load_artifact};
use crate::orchestrator::state::PipelineState;
use crate::phase::PhaseConfig;
use crate::prompts;
use crate::threads::ThreadManager;
use crate::util::extract_json_array;

pub const EXTRACT_PHASE: &str = "extract-steps";

/// One unit of implementation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplStep {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// Run (or reuse) the extraction phase and parse its steps.
pub async fn extract_impl_steps(
    runner: &PhaseRunner,
    state: &mut PipelineState,
    threads: &mut ThreadManager,
) -> Result<Vec<ImplStep>, PipelineError> {
    // A resumed run re-reads the artifact instead of paying for the phase
    // again.
    if !state.is_completed(EXTRACT_PHASE) {
        let config = runner.config();
        let phase = PhaseConfig::new(EXTRACT_PHASE, prompts::extract_steps())
            .with_model(config.model_for(EXTRACT_PHASE, crate::orchestrator::DEFAULT_FAST_MODEL))
            .with_max_turns(5)
            .with_budget(1.0)
            .with_timeout(config.timeout_for(EXTRACT_PHASE));
        runner.run_phase(state, threads, &phase).await?;
    }

    let artifact = load_artifact(&state.log_dir, EXTRACT_PHASE)?;
    let steps = parse_steps(&artifact.result);
    info!(count = steps.len(), "implementation plan extracted");
    Ok(steps)
}

/// Parse a JSON step array embedded in free text. Anything unparseable
/// yields an empty plan.
pub fn parse_steps(text: &str) -> Vec<ImplStep> {
    extract_json_array(text)
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}
