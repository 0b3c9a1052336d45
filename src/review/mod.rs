//! Dual-pass, bias-checked review.
//!
//! A gating review on the full tier runs twice: once normally, once with
//! the material read in reverse section order on the other model of the
//! review/implement pair, so neither ordering bias nor model bias can pass
//! a bad artifact alone. An optional external validator gets the first
//! pass's saved output on stdin. Disagreements resolve to the strictest
//! verdict.

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::errors::PipelineError;
use crate::gates::Tier;
use crate::orchestrator::runner::{PhaseRunner, artifact_path};
use crate::orchestrator::state::PipelineState;
use crate::phase::PhaseConfig;
use crate::prompts::REVERSE_ORDER_INSTRUCTION;
use crate::threads::ThreadManager;
use crate::verdict::{Verdict, parse_verdict};

/// External validators get a bounded slice of wall clock; a hung validator
/// must not stall the pipeline.
const VALIDATOR_TIMEOUT: Duration = Duration::from_secs(60);

/// Run a review phase, dual-pass on the full tier.
pub async fn run_review(
    runner: &PhaseRunner,
    state: &mut PipelineState,
    threads: &mut ThreadManager,
    phase: PhaseConfig,
    tier: Tier,
) -> Result<Verdict, PipelineError> {
    // Cheaper tiers take the single-pass verdict as-is.
    if tier != Tier::Full {
        let result = runner.run_phase(state, threads, &phase).await?;
        return Ok(result.verdict);
    }

    let pass1 = runner.run_phase(state, threads, &phase).await?;

    let pass2_name = format!("{}-pass2", phase.name);
    let pass2_phase = PhaseConfig::new(
        pass2_name.as_str(),
        format!("{}{}", phase.prompt, REVERSE_ORDER_INSTRUCTION),
    )
    .with_model(cross_model(runner, &phase.model))
    .with_max_turns(phase.max_turns)
    .with_budget(phase.max_budget_usd)
    .with_timeout(runner.config().timeout_for(&pass2_name));

    let pass2 = runner.run_phase(state, threads, &pass2_phase).await?;
    threads.record(&pass2_name, &pass2.session_id, Some(&phase.name));

    let external = match runner.config().review_validator_command() {
        Some(cmd) => run_external_validator(&cmd, state, &phase.name).await,
        None => None,
    };

    Ok(reconcile(&phase.name, pass1.verdict, pass2.verdict, external))
}

/// The other model of the review/implement pair, for pass independence.
fn cross_model(runner: &PhaseRunner, pass1_model: &str) -> String {
    let config = runner.config();
    let review_model = config.str("MODEL_REVIEW", crate::orchestrator::DEFAULT_FAST_MODEL);
    let implement_model = config.str("MODEL_IMPLEMENT", crate::orchestrator::DEFAULT_HEAVY_MODEL);
    if pass1_model == review_model {
        implement_model
    } else {
        review_model
    }
}

/// Pipe the pass-1 artifact through the configured shell command and scan
/// its stdout for a verdict. Every failure mode is tolerated: the validator
/// is advisory.
async fn run_external_validator(
    command: &str,
    state: &PipelineState,
    phase_name: &str,
) -> Option<Verdict> {
    let artifact = std::fs::read_to_string(artifact_path(&state.log_dir, phase_name)).ok()?;

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            warn!(%err, command, "external validator failed to spawn, ignoring");
            return None;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if stdin.write_all(artifact.as_bytes()).await.is_err() {
            warn!(command, "external validator closed stdin early");
        }
        drop(stdin);
    }

    let output = match tokio::time::timeout(VALIDATOR_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!(%err, command, "external validator failed, ignoring");
            return None;
        }
        Err(_) => {
            warn!(command, "external validator timed out, ignoring");
            return None;
        }
    };

    if !output.status.success() {
        warn!(code = output.status.code(), command, "external validator exited non-zero, ignoring");
    }

    match parse_verdict(&String::from_utf8_lossy(&output.stdout)) {
        Verdict::Unknown => None,
        verdict => Some(verdict),
    }
}

/// Agreement returns the shared verdict; otherwise the strictest wins.
fn reconcile(gate: &str, pass1: Verdict, pass2: Verdict, external: Option<Verdict>) -> Verdict {
    if pass1 != pass2 {
        warn!(gate, %pass1, %pass2, "review passes disagree, taking the strictest");
        println!(
            "  {} Review passes disagree: pass1={pass1} pass2={pass2}",
            console::style("⚠").yellow()
        );
    }
    if let Some(ext) = external
        && (ext != pass1 || ext != pass2)
    {
        warn!(gate, external = %ext, "external validator disagrees with review passes");
        println!(
            "  {} External validator verdict: {ext}",
            console::style("⚠").yellow()
        );
    }

    let mut verdict = if pass1.strictness() >= pass2.strictness() { pass1 } else { pass2 };
    if let Some(ext) = external
        && ext.strictness() > verdict.strictness()
    {
        verdict = ext;
    }
    verdict
}
