//! Single-phase execution.
//!
//! `PhaseRunner` owns the contract around one agent invocation: the kill
//! switch and cost ceiling are checked first, the call is bounded by the
//! phase timeout, and the attempt is persisted (artifact, checkpoint, cost
//! ledger) whether it succeeded or not. An errored phase is recorded and
//! then raised so the driver decides whether to absorb it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::agent::{Agent, AgentRequest};
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::orchestrator::state::{PhaseResult, PipelineState, RunStatus};
use crate::phase::PhaseConfig;
use crate::threads::ThreadManager;
use crate::util::write_atomic;
use crate::verdict::{Verdict, parse_satisfaction, parse_verdict};

/// On-disk record of one phase: full agent text plus the parsed fields.
#[derive(Debug, Serialize, Deserialize)]
pub struct PhaseArtifact {
    pub name: String,
    /// Agent output text, or the error message when the phase errored.
    pub result: String,
    pub cost_usd: f64,
    pub turns: u32,
    pub verdict: Verdict,
    pub satisfaction_score: f64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn artifact_path(log_dir: &Path, phase_name: &str) -> PathBuf {
    log_dir.join(format!("{phase_name}.json"))
}

pub fn load_artifact(log_dir: &Path, phase_name: &str) -> Result<PhaseArtifact> {
    let path = artifact_path(log_dir, phase_name);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read phase artifact: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse phase artifact: {}", path.display()))
}

pub struct PhaseRunner {
    config: PipelineConfig,
    agent: Arc<dyn Agent>,
}

impl PhaseRunner {
    pub fn new(config: PipelineConfig, agent: Arc<dyn Agent>) -> Self {
        Self { config, agent }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one phase end to end.
    ///
    /// Side effects, in order: current-phase checkpoint, agent call,
    /// artifact write, result append, checkpoint, cost ledger. The ledger
    /// write never precedes the checkpoint write, so a resume always sees
    /// at least as much as any other reader.
    pub async fn run_phase(
        &self,
        state: &mut PipelineState,
        threads: &mut ThreadManager,
        phase: &PhaseConfig,
    ) -> Result<PhaseResult, PipelineError> {
        if let Err(err) = state.check_kill_switch().and_then(|()| state.check_cost_ceiling()) {
            state.status = RunStatus::Failed;
            let _ = state.save_checkpoint();
            let _ = state.save_costs();
            return Err(err);
        }

        state.current_phase = phase.name.clone();
        state.save_checkpoint()?;

        let rule = console::style("━".repeat(60)).dim();
        println!("\n{rule}");
        println!("  Phase: {}", console::style(&phase.name).cyan().bold());
        println!(
            "  Model: {} | Max turns: {} | Budget: ${:.2}",
            phase.model, phase.max_turns, phase.max_budget_usd
        );
        println!("{rule}\n");
        info!(phase = %phase.name, model = %phase.model, timeout = phase.timeout_seconds, "running phase");

        let request = AgentRequest::new(
            phase.model.clone(),
            phase.max_turns,
            phase.max_budget_usd,
            phase.prompt.clone(),
        );

        let mut agent_text = String::new();
        let result = match tokio::time::timeout(
            Duration::from_secs(phase.timeout_seconds),
            self.agent.run(&request),
        )
        .await
        {
            Ok(Ok(outcome)) => {
                agent_text = outcome.text;
                PhaseResult {
                    name: phase.name.clone(),
                    cost_usd: outcome.cost_usd,
                    turns: outcome.num_turns,
                    verdict: parse_verdict(&agent_text),
                    satisfaction_score: parse_satisfaction(&agent_text),
                    session_id: outcome.session_id,
                    error: None,
                }
            }
            Ok(Err(err)) => PhaseResult::errored(phase.name.as_str(), err.to_string()),
            Err(_) => PhaseResult::errored(
                phase.name.as_str(),
                format!("Timeout after {}s", phase.timeout_seconds),
            ),
        };

        self.save_artifact(state, &result, &agent_text)?;
        threads.record(&phase.name, &result.session_id, None);

        state.record(result.clone());
        state.save_checkpoint()?;
        state.save_costs()?;

        match &result.error {
            Some(error) => {
                println!("  Result: {}", console::style(format!("error: {error}")).red());
                Err(PipelineError::PhaseFailed {
                    phase: phase.name.clone(),
                    message: error.clone(),
                })
            }
            None => {
                println!(
                    "  Result: verdict={} cost=${:.2} turns={}",
                    console::style(result.verdict.as_str()).green(),
                    result.cost_usd,
                    result.turns
                );
                Ok(result)
            }
        }
    }

    fn save_artifact(
        &self,
        state: &PipelineState,
        result: &PhaseResult,
        agent_text: &str,
    ) -> Result<()> {
        let artifact = PhaseArtifact {
            name: result.name.clone(),
            result: match &result.error {
                Some(error) => error.clone(),
                None => agent_text.to_string(),
            },
            cost_usd: result.cost_usd,
            turns: result.turns,
            verdict: result.verdict,
            satisfaction_score: result.satisfaction_score,
            session_id: result.session_id.clone(),
            error: result.error.clone(),
        };
        let content = serde_json::to_string_pretty(&artifact)
            .context("Failed to serialize phase artifact")?;
        write_atomic(&artifact_path(&state.log_dir, &result.name), &content)
    }
}
