//! The implementation loop.
//!
//! Each extracted step runs as implement/verify pairs with a bounded retry
//! budget. Between attempts the loop feeds the previous verification
//! failure back into the prompt, watches git for real progress, and asks
//! for a different approach when consecutive attempts stagnate. A step
//! that exhausts its budget blocks the whole pipeline.

pub mod extract;

pub use extract::{EXTRACT_PHASE, ImplStep, extract_impl_steps, parse_steps};

use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::orchestrator::runner::{PhaseRunner, artifact_path, load_artifact};
use crate::orchestrator::state::{PipelineState, RunStatus};
use crate::phase::PhaseConfig;
use crate::prompts;
use crate::router::{Route, route_from_gate};
use crate::stagnation::StagnationDetector;
use crate::threads::ThreadManager;
use crate::tracker::ProgressTracker;
use crate::util::head_lines;
use crate::verdict::Verdict;

/// Lines of the previous verify output carried into a retry prompt.
const ERROR_CONTEXT_LINES: usize = 50;

/// Extract the plan and drive every step to verification.
///
/// Returns `Err(StepBlocked)` as soon as one step exhausts its retries;
/// later steps never start.
pub async fn run_implementation(
    runner: &PhaseRunner,
    state: &mut PipelineState,
    threads: &mut ThreadManager,
    tracker: &mut ProgressTracker,
) -> Result<(), PipelineError> {
    let steps = extract_impl_steps(runner, state, threads).await?;
    println!("\nImplementation plan has {} steps", steps.len());

    for step in &steps {
        if step_already_verified(state, step) {
            info!(step = %step.id, "step already verified, skipping");
            continue;
        }

        println!("\n--- Implementing: {} - {} ---", step.id, step.title);
        let verified = implement_and_verify(runner, state, threads, tracker, step).await?;
        if !verified {
            return Err(PipelineError::StepBlocked {
                step: step.id.clone(),
                attempts: runner.config().max_verify_retries(),
            });
        }
    }

    Ok(())
}

/// Implement one step with the retry loop. `Ok(true)` means verified;
/// `Ok(false)` means terminally blocked (marker written, status set).
pub async fn implement_and_verify(
    runner: &PhaseRunner,
    state: &mut PipelineState,
    threads: &mut ThreadManager,
    tracker: &mut ProgressTracker,
    step: &ImplStep,
) -> Result<bool, PipelineError> {
    let config = runner.config().clone();
    let max_retries = config.max_verify_retries();
    let detector = StagnationDetector::new(config.stagnation_threshold());
    let summaries_dir = config.summaries_dir();

    // A resumed run continues numbering after its recorded attempts.
    let first = next_attempt(state, step);

    for attempt in first..=max_retries {
        let error_context = build_error_context(state, step, attempt, max_retries, &detector);
        let specs_prewritten = summaries_dir.join("spec-writer-summary.md").exists();

        let implement_name = format!("implement-{}-attempt-{}", step.id, attempt);
        let implement_phase = PhaseConfig::new(
            implement_name.as_str(),
            prompts::implement_step(step, &error_context, specs_prewritten, &summaries_dir),
        )
        .with_model(config.model_for(&implement_name, crate::orchestrator::DEFAULT_HEAVY_MODEL))
        .with_max_turns(40)
        .with_budget(8.0)
        .with_timeout(config.timeout_for(&implement_name));

        runner.run_phase(state, threads, &implement_phase).await?;

        if !tracker.check(&implement_name) {
            state.status = RunStatus::StalledNoProgress;
            state.save_checkpoint()?;
            return Err(PipelineError::NoProgress {
                phase: implement_name,
                count: tracker.no_progress_count(),
            });
        }

        // Fast checks on early attempts; the full suite on the last one.
        let fast = attempt < max_retries;
        let verify_name = format!("verify-{}-attempt-{}", step.id, attempt);
        let verify_phase = PhaseConfig::new(verify_name.as_str(), prompts::verify_step(step, fast))
            .with_model(config.model_for(&verify_name, crate::orchestrator::DEFAULT_FAST_MODEL))
            .with_max_turns(15)
            .with_budget(3.0)
            .with_timeout(config.timeout_for(&verify_name));

        let verdict = match runner.run_phase(state, threads, &verify_phase).await {
            Ok(result) => result.verdict,
            // A verify timeout or agent error burns the attempt as a FAIL.
            Err(PipelineError::PhaseFailed { .. }) => Verdict::Fail,
            Err(other) => return Err(other),
        };

        match route_from_gate("verify", verdict, attempt, max_retries) {
            Route::NextStepOrHoldout => {
                println!("  Step {} verified on attempt {attempt}", step.id);
                return Ok(true);
            }
            Route::Blocked => {
                warn!(step = %step.id, attempt, "verification budget exhausted");
                write_blocker_marker(state, step, max_retries)?;
                state.status = RunStatus::Blocked;
                state.save_checkpoint()?;
                return Ok(false);
            }
            Route::To(_) => {
                warn!(step = %step.id, attempt, max_retries, "step failed verification, retrying");
            }
        }
    }

    Ok(false)
}

fn step_already_verified(state: &PipelineState, step: &ImplStep) -> bool {
    let prefix = format!("verify-{}-attempt-", step.id);
    state
        .phases
        .iter()
        .any(|p| p.name.starts_with(&prefix) && p.verdict.is_pass())
}

fn next_attempt(state: &PipelineState, step: &ImplStep) -> u32 {
    let prefix = format!("implement-{}-attempt-", step.id);
    1 + state.phases.iter().filter(|p| p.name.starts_with(&prefix)).count() as u32
}

/// Retry banner plus the head of the previous verify output; a stagnation
/// note when the last two attempts looked the same.
fn build_error_context(
    state: &PipelineState,
    step: &ImplStep,
    attempt: u32,
    max_retries: u32,
    detector: &StagnationDetector,
) -> String {
    if attempt <= 1 {
        return String::new();
    }

    let mut context = String::new();
    let prev_name = format!("verify-{}-attempt-{}", step.id, attempt - 1);
    if let Ok(artifact) = load_artifact(&state.log_dir, &prev_name) {
        let excerpt = head_lines(&artifact.result, ERROR_CONTEXT_LINES);
        context = format!("RETRY ATTEMPT {attempt}/{max_retries}. Previous error:\n{excerpt}");
    }

    if attempt >= 3 {
        let older = artifact_path(
            &state.log_dir,
            &format!("verify-{}-attempt-{}", step.id, attempt - 2),
        );
        let newer = artifact_path(&state.log_dir, &prev_name);
        if detector.is_stagnant(&older, &newer) {
            context.push_str(
                "\n\nThe previous attempts produced nearly identical results. \
                 Try a DIFFERENT approach this time.",
            );
        }
    }

    context
}

fn write_blocker_marker(
    state: &PipelineState,
    step: &ImplStep,
    max_retries: u32,
) -> Result<(), PipelineError> {
    let marker = state.log_dir.join(format!("blocked-{}.txt", step.id));
    std::fs::write(
        &marker,
        format!(
            "BLOCKED: Step {} failed {} verification attempts.\nSee verify logs for details.\n",
            step.id, max_retries
        ),
    )
    .map_err(|e| PipelineError::Other(e.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::stub::StubAgent;
    use crate::config::PipelineConfig;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    const STEPS_JSON: &str = r#"[{"id": "step-1", "title": "One", "description": "first"},
        {"id": "step-2", "title": "Two", "description": "second"}]"#;

    fn test_state(dir: &Path) -> PipelineState {
        let mut state = PipelineState::new("T-7", &PipelineConfig::empty());
        state.log_dir = dir.join("run");
        state.kill_switch = dir.join(".pipeline-kill");
        state
    }

    fn runner_with(agent: Arc<StubAgent>) -> PhaseRunner {
        PhaseRunner::new(PipelineConfig::empty(), agent)
    }

    fn step(id: &str) -> ImplStep {
        ImplStep { id: id.into(), title: "Step".into(), description: "desc".into() }
    }

    #[tokio::test]
    async fn test_all_steps_verify_first_attempt() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        let mut threads = ThreadManager::new();
        // No git repo in the temp dir: progress checks are inert.
        let mut tracker = ProgressTracker::new(dir.path(), 3);

        let agent = Arc::new(
            StubAgent::new()
                .push_text(&format!("{STEPS_JSON}\nVERDICT: PASS")) // extract-steps
                .push_text("implemented\nVERDICT: PASS") // implement-step-1-attempt-1
                .push_text("checks green\nVERDICT: PASS") // verify-step-1-attempt-1
                .push_text("implemented\nVERDICT: PASS") // implement-step-2-attempt-1
                .push_text("checks green\nVERDICT: PASS"), // verify-step-2-attempt-1
        );
        let runner = runner_with(agent);

        run_implementation(&runner, &mut state, &mut threads, &mut tracker)
            .await
            .unwrap();

        let names: Vec<&str> = state.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "extract-steps",
                "implement-step-1-attempt-1",
                "verify-step-1-attempt-1",
                "implement-step-2-attempt-1",
                "verify-step-2-attempt-1",
            ]
        );
    }

    #[tokio::test]
    async fn test_verify_retry_then_success() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        let mut threads = ThreadManager::new();
        let mut tracker = ProgressTracker::new(dir.path(), 3);

        let agent = Arc::new(
            StubAgent::new()
                .push_text("implemented\nVERDICT: PASS")
                .push_text("error: type mismatch\nVERDICT: FAIL")
                .push_text("fixed\nVERDICT: PASS")
                .push_text("all green\nVERDICT: PASS"),
        );
        let runner = runner_with(agent.clone());

        let verified =
            implement_and_verify(&runner, &mut state, &mut threads, &mut tracker, &step("step-2"))
                .await
                .unwrap();
        assert!(verified);

        let names: Vec<&str> = state.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "implement-step-2-attempt-1",
                "verify-step-2-attempt-1",
                "implement-step-2-attempt-2",
                "verify-step-2-attempt-2",
            ]
        );

        // The retry prompt carried the previous failure.
        let requests = agent.requests.lock().unwrap();
        assert!(requests[2].prompt.contains("RETRY ATTEMPT 2/3"));
        assert!(requests[2].prompt.contains("type mismatch"));
    }

    #[tokio::test]
    async fn test_step_blocked_after_budget_exhausted() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        let mut threads = ThreadManager::new();
        let mut tracker = ProgressTracker::new(dir.path(), 3);

        let mut agent = StubAgent::new();
        for _ in 0..3 {
            agent = agent
                .push_text("tried\nVERDICT: PASS")
                .push_text("still broken\nVERDICT: FAIL");
        }
        let runner = runner_with(Arc::new(agent));

        let verified =
            implement_and_verify(&runner, &mut state, &mut threads, &mut tracker, &step("step-3"))
                .await
                .unwrap();
        assert!(!verified);
        assert_eq!(state.status, RunStatus::Blocked);
        assert!(state.log_dir.join("blocked-step-3.txt").exists());

        // Exactly three implement/verify pairs.
        let implements = state.phases.iter().filter(|p| p.name.starts_with("implement-")).count();
        let verifies = state.phases.iter().filter(|p| p.name.starts_with("verify-")).count();
        assert_eq!(implements, 3);
        assert_eq!(verifies, 3);
    }

    #[tokio::test]
    async fn test_blocked_step_halts_remaining_steps() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        let mut threads = ThreadManager::new();
        let mut tracker = ProgressTracker::new(dir.path(), 3);

        let mut agent = StubAgent::new().push_text(&format!("{STEPS_JSON}\nVERDICT: PASS"));
        for _ in 0..3 {
            agent = agent
                .push_text("tried\nVERDICT: PASS")
                .push_text("broken\nVERDICT: FAIL");
        }
        let runner = runner_with(Arc::new(agent));

        let err = run_implementation(&runner, &mut state, &mut threads, &mut tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StepBlocked { .. }));
        assert_eq!(err.exit_code(), 3);

        // step-2 never started.
        assert!(!state.phases.iter().any(|p| p.name.contains("step-2")));
    }

    #[tokio::test]
    async fn test_verify_agent_error_counts_as_failed_attempt() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        let mut threads = ThreadManager::new();
        let mut tracker = ProgressTracker::new(dir.path(), 3);

        let agent = Arc::new(
            StubAgent::new()
                .push_text("implemented\nVERDICT: PASS")
                .push_error("agent crashed") // verify attempt 1 errors
                .push_text("implemented again\nVERDICT: PASS")
                .push_text("green\nVERDICT: PASS"),
        );
        let runner = runner_with(agent);

        let verified =
            implement_and_verify(&runner, &mut state, &mut threads, &mut tracker, &step("step-1"))
                .await
                .unwrap();
        assert!(verified);
        // The errored verify is still in the ledger.
        assert!(state.phases.iter().any(|p| p.name == "verify-step-1-attempt-1" && p.is_error()));
    }

    #[tokio::test]
    async fn test_stagnation_note_added_on_third_attempt() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        let mut threads = ThreadManager::new();
        let mut tracker = ProgressTracker::new(dir.path(), 3);

        // Attempts 1 and 2 fail verification with identical output, so the
        // attempt-3 prompt must ask for a different approach.
        let agent = Arc::new(
            StubAgent::new()
                .push_text("impl\nVERDICT: PASS")
                .push_text("error: same failure\nVERDICT: FAIL")
                .push_text("impl\nVERDICT: PASS")
                .push_text("error: same failure\nVERDICT: FAIL")
                .push_text("impl\nVERDICT: PASS")
                .push_text("green\nVERDICT: PASS"),
        );
        let runner = runner_with(agent.clone());

        let verified =
            implement_and_verify(&runner, &mut state, &mut threads, &mut tracker, &step("step-1"))
                .await
                .unwrap();
        assert!(verified);

        let requests = agent.requests.lock().unwrap();
        // Request 4 is implement-step-1-attempt-3.
        assert!(requests[4].prompt.contains("DIFFERENT approach"));
        // The attempt-2 implement prompt has the retry banner but no
        // stagnation note yet.
        assert!(requests[2].prompt.contains("RETRY ATTEMPT 2/3"));
        assert!(!requests[2].prompt.contains("DIFFERENT approach"));
    }

    #[tokio::test]
    async fn test_resume_skips_verified_steps() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        let mut threads = ThreadManager::new();
        let mut tracker = ProgressTracker::new(dir.path(), 3);

        // Simulate a resumed checkpoint: extraction and step-1 already done.
        let agent_seed = Arc::new(
            StubAgent::new()
                .push_text(&format!("{STEPS_JSON}\nVERDICT: PASS"))
                .push_text("impl\nVERDICT: PASS")
                .push_text("green\nVERDICT: PASS"),
        );
        let runner = runner_with(agent_seed);
        let steps = extract_impl_steps(&runner, &mut state, &mut threads).await.unwrap();
        implement_and_verify(&runner, &mut state, &mut threads, &mut tracker, &steps[0])
            .await
            .unwrap();

        // Second pass: only step-2 work remains.
        let agent = Arc::new(
            StubAgent::new()
                .push_text("impl 2\nVERDICT: PASS")
                .push_text("green\nVERDICT: PASS"),
        );
        let runner = runner_with(agent);
        run_implementation(&runner, &mut state, &mut threads, &mut tracker)
            .await
            .unwrap();

        let step2_phases = state.phases.iter().filter(|p| p.name.contains("step-2")).count();
        assert_eq!(step2_phases, 2);
        // step-1 was not re-run: still exactly one implement/verify pair.
        let step1_phases = state.phases.iter().filter(|p| p.name.contains("step-1")).count();
        assert_eq!(step1_phases, 2);
    }

    #[test]
    fn test_error_context_empty_on_first_attempt() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let detector = StagnationDetector::new(0.9);
        assert_eq!(build_error_context(&state, &step("step-1"), 1, 3, &detector), "");
    }
}
