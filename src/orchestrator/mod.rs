//! Pipeline driver.
//!
//! The driver owns the end-to-end sequence: for each stage in the phase
//! order it consults the gate filter, runs the phase (or the review /
//! implementation composite around it), and branches on the router's
//! verdict. Exactly one phase runs at a time; every terminal path leaves a
//! persisted checkpoint, cost ledger, and metrics entry behind.

pub mod runner;
pub mod state;

pub use runner::{PhaseArtifact, PhaseRunner, artifact_path, load_artifact};
pub use state::{PhaseResult, PipelineState, RunStatus};

use glob::glob;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::agent::Agent;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::gates::PhaseFilter;
use crate::implement;
use crate::phase::PhaseConfig;
use crate::prompts;
use crate::review;
use crate::router::{Route, route_from_gate};
use crate::threads::ThreadManager;
use crate::tracker::ProgressTracker;

pub const DEFAULT_HEAVY_MODEL: &str = "claude-opus-4-6";
pub const DEFAULT_FAST_MODEL: &str = "claude-sonnet-4-5-20250929";

pub struct Pipeline {
    runner: PhaseRunner,
    filter: PhaseFilter,
    tracker: ProgressTracker,
    threads: ThreadManager,
    pub state: PipelineState,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, agent: Arc<dyn Agent>, state: PipelineState) -> Self {
        let filter = PhaseFilter::new(&config);
        let tracker = ProgressTracker::new(".", config.max_no_progress());
        let runner = PhaseRunner::new(config, agent);
        Self {
            runner,
            filter,
            tracker,
            threads: ThreadManager::new(),
            state,
        }
    }

    fn config(&self) -> &PipelineConfig {
        self.runner.config()
    }

    fn phase(&self, name: &str, prompt: String, default_model: &str, turns: u32, budget: f64) -> PhaseConfig {
        let config = self.config();
        PhaseConfig::new(name, prompt)
            .with_model(config.model_for(name, default_model))
            .with_max_turns(turns)
            .with_budget(budget)
            .with_timeout(config.timeout_for(name))
    }

    /// Execute the configured stage sequence to completion.
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        let stages: Vec<String> = self.filter.stage_order().to_vec();

        for stage in stages {
            if !self.filter.should_run_phase(&mut self.state, &stage)? {
                continue;
            }

            match stage.as_str() {
                "phase0" => {
                    let phase = self.phase("phase0", prompts::phase0(), DEFAULT_FAST_MODEL, 15, 2.0);
                    self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;
                }
                "interrogate" => {
                    let prompt = prompts::interrogate(&self.state.ticket);
                    let phase = self.phase("interrogate", prompt, DEFAULT_HEAVY_MODEL, 50, 8.0);
                    self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;
                }
                "interrogation-review" => self.interrogation_review_gate().await?,
                "generate-docs" => {
                    let prompt = prompts::generate_docs(&self.config().templates_dir());
                    let phase = self.phase("generate-docs", prompt, DEFAULT_HEAVY_MODEL, 50, 10.0);
                    self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;
                }
                "doc-review" => self.doc_review_gate().await?,
                "write-specs" => {
                    let prompt = prompts::write_specs(&self.config().summaries_dir());
                    let phase = self.phase("write-specs", prompt, DEFAULT_HEAVY_MODEL, 40, 6.0);
                    self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;
                }
                "holdout-generate" => self.holdout_generate_stage().await?,
                "implement" => {
                    implement::run_implementation(
                        &self.runner,
                        &mut self.state,
                        &mut self.threads,
                        &mut self.tracker,
                    )
                    .await?;
                }
                "holdout-validate" => self.holdout_validate_gate().await?,
                "security-audit" => self.security_audit_gate().await?,
                "ship" => {
                    let prompt = prompts::ship(&self.state.ticket);
                    let phase = self.phase("ship", prompt, DEFAULT_FAST_MODEL, 20, 5.0);
                    self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;
                }
                other => warn!(stage = other, "unknown stage, skipping"),
            }
        }

        self.state.status = RunStatus::Completed;
        self.state.save_checkpoint()?;
        Ok(())
    }

    /// Interrogation review with the bounded iterate loop: an ITERATE
    /// verdict re-runs interrogation and reviews again, up to the cap.
    async fn interrogation_review_gate(&mut self) -> Result<(), PipelineError> {
        let tier = self.filter.resolve_tier(&mut self.state);
        let max_iterations = self.config().max_interrogation_iterations();
        let max_retries = self.config().max_verify_retries();
        let mut iteration = 0u32;

        loop {
            let name = review_name("interrogation-review", iteration);
            let phase = self.phase(&name, prompts::interrogation_review(), DEFAULT_FAST_MODEL, 20, 3.0);
            let verdict =
                review::run_review(&self.runner, &mut self.state, &mut self.threads, phase, tier).await?;

            match route_from_gate("interrogation-review", verdict, 0, max_retries) {
                Route::To("interrogate") => {
                    if iteration >= max_iterations {
                        warn!(iteration, "interrogation iterations exhausted");
                        return Err(self.pause_for_human("interrogation-review"));
                    }
                    iteration += 1;
                    let name = format!("interrogate-v{}", iteration + 1);
                    let prompt = prompts::interrogate_retry(iteration + 1);
                    let phase = self.phase(&name, prompt, DEFAULT_HEAVY_MODEL, 50, 8.0);
                    self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;
                }
                Route::To(_) => return Ok(()),
                _ => return Err(self.pause_for_human("interrogation-review")),
            }
        }
    }

    /// Doc review with the same bounded iterate loop.
    async fn doc_review_gate(&mut self) -> Result<(), PipelineError> {
        let tier = self.filter.resolve_tier(&mut self.state);
        let max_iterations = self.config().max_interrogation_iterations();
        let max_retries = self.config().max_verify_retries();
        let mut iteration = 0u32;

        loop {
            let name = review_name("doc-review", iteration);
            let phase = self.phase(&name, prompts::doc_review(), DEFAULT_FAST_MODEL, 20, 3.0);
            let verdict =
                review::run_review(&self.runner, &mut self.state, &mut self.threads, phase, tier).await?;

            match route_from_gate("doc-review", verdict, 0, max_retries) {
                Route::To("generate-docs") => {
                    if iteration >= max_iterations {
                        warn!(iteration, "doc iterations exhausted");
                        return Err(self.pause_for_human("doc-review"));
                    }
                    iteration += 1;
                    let name = format!("generate-docs-v{}", iteration + 1);
                    let phase =
                        self.phase(&name, prompts::generate_docs_retry(), DEFAULT_HEAVY_MODEL, 50, 10.0);
                    self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;
                }
                Route::To(_) => return Ok(()),
                _ => return Err(self.pause_for_human("doc-review")),
            }
        }
    }

    /// Generate holdouts unless an earlier run already left some behind.
    async fn holdout_generate_stage(&mut self) -> Result<(), PipelineError> {
        let holdouts_dir = self.config().holdouts_dir();
        if !holdout_files(&holdouts_dir, "holdout-001-*.md").is_empty() {
            info!(dir = %holdouts_dir.display(), "holdouts already present, skipping generation");
            return Ok(());
        }

        let prompt = prompts::holdout_generate(&holdouts_dir);
        let phase = self.phase("holdout-generate", prompt, DEFAULT_FAST_MODEL, 25, 5.0);
        self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;
        Ok(())
    }

    /// Validate against holdout scenarios; a FAIL is terminal.
    async fn holdout_validate_gate(&mut self) -> Result<(), PipelineError> {
        let holdouts_dir = self.config().holdouts_dir();
        if holdout_files(&holdouts_dir, "holdout-*.md").is_empty() {
            info!(dir = %holdouts_dir.display(), "no holdouts on disk, skipping validation");
            return Ok(());
        }

        let prompt = prompts::holdout_validate(&holdouts_dir);
        let phase = self.phase("holdout-validate", prompt, DEFAULT_FAST_MODEL, 25, 5.0);
        let result = self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;

        let max_retries = self.config().max_verify_retries();
        match route_from_gate("holdout-validate", result.verdict, 0, max_retries) {
            Route::To("implement") => {
                self.state.status = RunStatus::HoldoutFailed;
                self.state.save_checkpoint()?;
                println!("\n{} Holdout validation failed", console::style("✗").red());
                Err(PipelineError::HoldoutFailed)
            }
            Route::To(_) => Ok(()),
            _ => Err(self.pause_for_human("holdout-validate")),
        }
    }

    /// Security audit with one auto-fix round: FAIL triggers a fix phase
    /// and a re-audit; a second FAIL is terminal.
    async fn security_audit_gate(&mut self) -> Result<(), PipelineError> {
        let phase = self.phase("security-audit", prompts::security_audit(), DEFAULT_FAST_MODEL, 20, 3.0);
        let result = self.runner.run_phase(&mut self.state, &mut self.threads, &phase).await?;

        let max_retries = self.config().max_verify_retries();
        match route_from_gate("security-audit", result.verdict, 0, max_retries) {
            Route::To("implement") => {
                warn!("security blockers found, attempting auto-fix");
                let audit_artifact = artifact_path(&self.state.log_dir, "security-audit");
                let prompt = prompts::security_fix(&audit_artifact);
                let fix = self.phase("security-fix", prompt, DEFAULT_HEAVY_MODEL, 40, 8.0);
                self.runner.run_phase(&mut self.state, &mut self.threads, &fix).await?;

                let re_audit =
                    self.phase("security-audit-v2", prompts::security_audit(), DEFAULT_FAST_MODEL, 20, 3.0);
                let result = self.runner.run_phase(&mut self.state, &mut self.threads, &re_audit).await?;

                match route_from_gate("security-audit", result.verdict, 0, max_retries) {
                    Route::To("ship") => Ok(()),
                    _ => {
                        self.state.status = RunStatus::Failed;
                        self.state.save_checkpoint()?;
                        Err(PipelineError::PhaseFailed {
                            phase: "security-audit-v2".to_string(),
                            message: "security blockers remain after auto-fix".to_string(),
                        })
                    }
                }
            }
            Route::To(_) => Ok(()),
            _ => Err(self.pause_for_human("security-audit")),
        }
    }

    fn pause_for_human(&mut self, gate: &str) -> PipelineError {
        self.state.status = RunStatus::NeedsHuman;
        if let Err(err) = self.state.save_checkpoint() {
            error!(%err, "failed to persist checkpoint while pausing");
        }
        println!("\nPipeline paused: human input needed for {gate}");
        PipelineError::NeedsHuman { gate: gate.to_string() }
    }

    /// Always-run epilogue: persist everything and print the cost report.
    pub fn finalize(&mut self, outcome: &Result<(), PipelineError>) {
        if let Err(err) = outcome {
            // Statuses like blocked or needs_human were set at the failure
            // site; anything still marked running is a generic failure.
            if self.state.status == RunStatus::Running {
                self.state.status = RunStatus::Failed;
            }
            error!(%err, "pipeline did not complete");
        }

        for (what, result) in [
            ("checkpoint", self.state.save_checkpoint()),
            ("cost ledger", self.state.save_costs()),
            ("metrics", self.state.append_metrics(&self.config().metrics_file())),
        ] {
            if let Err(err) = result {
                error!(%err, what, "failed to persist on shutdown");
            }
        }

        let rule = console::style("━".repeat(60)).dim();
        let headline = match self.state.status {
            RunStatus::Completed => "PIPELINE COMPLETE".to_string(),
            status => format!("PIPELINE {}", status.as_str().to_uppercase()),
        };
        println!("\n{rule}");
        println!("  {}", console::style(headline).bold());
        println!("{rule}");
        println!("  Ticket: {}", self.state.ticket);
        println!("  Total cost: ${:.2}", self.state.total_cost);
        println!("  Logs: {}", self.state.log_dir.display());
        println!("  Cost breakdown:");
        for phase in &self.state.phases {
            println!("    {}: ${:.2} ({} turns)", phase.name, phase.cost_usd, phase.turns);
        }
        println!("  Checkpoint: {}", self.state.checkpoint_path().display());
    }
}

fn review_name(gate: &str, iteration: u32) -> String {
    if iteration == 0 {
        gate.to_string()
    } else {
        format!("{gate}-v{}", iteration + 1)
    }
}

fn holdout_files(dir: &std::path::Path, pattern: &str) -> Vec<std::path::PathBuf> {
    let pattern = dir.join(pattern).to_string_lossy().to_string();
    glob(&pattern)
        .map(|entries| entries.filter_map(Result::ok).collect())
        .unwrap_or_default()
}
