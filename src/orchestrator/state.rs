//! Pipeline state and persistence.
//!
//! `PipelineState` is the single aggregate for a run: accumulated results,
//! cost, status, and the per-run log directory. Every state transition is
//! flushed to `checkpoint.json` before control returns to the driver, and
//! the cost ledger follows each checkpoint write. All files that a later
//! resume (or any other reader) may consume are written temp-then-rename.

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::gates::Tier;
use crate::util::write_atomic;
use crate::verdict::Verdict;

static RETRY_PHASE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"attempt-[2-9]").unwrap());

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    NeedsHuman,
    NeedsHumanGate,
    Blocked,
    StalledNoProgress,
    HoldoutFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::NeedsHuman => "needs_human",
            RunStatus::NeedsHumanGate => "needs_human_gate",
            RunStatus::Blocked => "blocked",
            RunStatus::StalledNoProgress => "stalled_no_progress",
            RunStatus::HoldoutFailed => "holdout_failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one phase invocation.
///
/// A result carries either a usable verdict or an error, never both: error
/// results keep `Verdict::Unknown` and a zero score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: String,
    pub cost_usd: f64,
    pub turns: u32,
    pub verdict: Verdict,
    pub satisfaction_score: f64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn errored(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cost_usd: 0.0,
            turns: 0,
            verdict: Verdict::Unknown,
            satisfaction_score: 0.0,
            session_id: String::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Snapshot written to `checkpoint.json` after every transition.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub status: RunStatus,
    pub current_phase: String,
    pub ticket: String,
    pub total_cost: f64,
    pub timestamp: String,
    pub phases: Vec<PhaseSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub name: String,
    pub cost: f64,
    pub turns: u32,
    pub verdict: Verdict,
}

/// Cost ledger written to `costs.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CostLedger {
    pub phases: Vec<CostEntry>,
    pub total_cost: f64,
    pub status: RunStatus,
    pub started: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CostEntry {
    pub name: String,
    pub cost: f64,
    pub turns: u32,
    pub session_id: String,
}

/// One run's entry in the shared metrics file.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsEntry {
    pub ticket: String,
    pub timestamp: String,
    pub tier: String,
    pub total_cost: f64,
    pub phase_count: usize,
    pub retry_count: usize,
    pub final_status: RunStatus,
    pub log_dir: String,
}

/// The singleton state aggregate for one pipeline run.
#[derive(Debug)]
pub struct PipelineState {
    pub ticket: String,
    pub status: RunStatus,
    pub current_phase: String,
    pub total_cost: f64,
    pub max_cost: f64,
    /// Phase to resume from; empty list of skips for fresh runs.
    pub resume_from: Option<String>,
    pub phases: Vec<PhaseResult>,
    pub log_dir: PathBuf,
    pub kill_switch: PathBuf,
    pub tier: Option<Tier>,
}

impl PipelineState {
    /// Fresh run: a new timestamped log directory under the base dir.
    pub fn new(ticket: impl Into<String>, config: &PipelineConfig) -> Self {
        let log_dir = config
            .log_base_dir()
            .join(Local::now().format("%Y-%m-%d-%H%M").to_string());
        Self {
            ticket: ticket.into(),
            status: RunStatus::Running,
            current_phase: String::new(),
            total_cost: 0.0,
            max_cost: config.max_cost(),
            resume_from: None,
            phases: Vec::new(),
            log_dir,
            kill_switch: config.kill_switch_file(),
            tier: None,
        }
    }

    /// Resume from an existing log directory's checkpoint. The checkpoint's
    /// current phase becomes the resume anchor and its total cost seeds the
    /// accumulator; completed phases are restored so they are not re-run.
    pub fn resume(log_dir: &Path, config: &PipelineConfig) -> Result<Self> {
        let path = log_dir.join("checkpoint.json");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;

        let phases = checkpoint
            .phases
            .into_iter()
            .map(|p| PhaseResult {
                name: p.name,
                cost_usd: p.cost,
                turns: p.turns,
                verdict: p.verdict,
                satisfaction_score: 0.0,
                session_id: String::new(),
                error: None,
            })
            .collect();

        Ok(Self {
            ticket: checkpoint.ticket,
            status: RunStatus::Running,
            current_phase: String::new(),
            total_cost: checkpoint.total_cost,
            max_cost: config.max_cost(),
            resume_from: Some(checkpoint.current_phase).filter(|p| !p.is_empty()),
            phases,
            log_dir: log_dir.to_path_buf(),
            kill_switch: config.kill_switch_file(),
            tier: None,
        })
    }

    pub fn check_kill_switch(&self) -> Result<(), PipelineError> {
        if self.kill_switch.exists() {
            return Err(PipelineError::KillSwitch(self.kill_switch.clone()));
        }
        Ok(())
    }

    pub fn check_cost_ceiling(&self) -> Result<(), PipelineError> {
        if self.total_cost > self.max_cost {
            return Err(PipelineError::CostCeiling {
                spent: self.total_cost,
                ceiling: self.max_cost,
            });
        }
        Ok(())
    }

    /// Whether a phase of this exact name already completed (this run or a
    /// resumed checkpoint).
    pub fn is_completed(&self, phase: &str) -> bool {
        self.phases.iter().any(|p| p.name == phase)
    }

    /// Append a result and fold its cost into the total.
    pub fn record(&mut self, result: PhaseResult) {
        self.total_cost += result.cost_usd;
        self.phases.push(result);
    }

    /// Number of phases that were retries (second attempt onwards).
    pub fn retry_count(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| RETRY_PHASE.is_match(&p.name))
            .count()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.log_dir.join("checkpoint.json")
    }

    pub fn costs_path(&self) -> PathBuf {
        self.log_dir.join("costs.json")
    }

    pub fn save_checkpoint(&self) -> Result<()> {
        let checkpoint = Checkpoint {
            status: self.status,
            current_phase: self.current_phase.clone(),
            ticket: self.ticket.clone(),
            total_cost: self.total_cost,
            timestamp: Utc::now().to_rfc3339(),
            phases: self
                .phases
                .iter()
                .map(|p| PhaseSummary {
                    name: p.name.clone(),
                    cost: p.cost_usd,
                    turns: p.turns,
                    verdict: p.verdict,
                })
                .collect(),
        };
        let content = serde_json::to_string_pretty(&checkpoint)
            .context("Failed to serialize checkpoint")?;
        write_atomic(&self.checkpoint_path(), &content)
    }

    pub fn save_costs(&self) -> Result<()> {
        let ledger = CostLedger {
            phases: self
                .phases
                .iter()
                .map(|p| CostEntry {
                    name: p.name.clone(),
                    cost: p.cost_usd,
                    turns: p.turns,
                    session_id: p.session_id.clone(),
                })
                .collect(),
            total_cost: self.total_cost,
            status: self.status,
            started: self
                .phases
                .first()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        let content =
            serde_json::to_string_pretty(&ledger).context("Failed to serialize cost ledger")?;
        write_atomic(&self.costs_path(), &content)
    }

    /// Append this run's entry to the shared metrics file.
    ///
    /// Read-modify-write: safe for serialized runs on one host, not for
    /// concurrent writers.
    pub fn append_metrics(&self, metrics_file: &Path) -> Result<()> {
        let mut entries: Vec<MetricsEntry> = match std::fs::read_to_string(metrics_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        entries.push(MetricsEntry {
            ticket: self.ticket.clone(),
            timestamp: Utc::now().to_rfc3339(),
            tier: self
                .tier
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unresolved".to_string()),
            total_cost: self.total_cost,
            phase_count: self.phases.len(),
            retry_count: self.retry_count(),
            final_status: self.status,
            log_dir: self.log_dir.display().to_string(),
        });

        let content =
            serde_json::to_string_pretty(&entries).context("Failed to serialize metrics")?;
        write_atomic(metrics_file, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_state(dir: &Path) -> PipelineState {
        let mut state = PipelineState::new("TICKET-1", &PipelineConfig::empty());
        state.log_dir = dir.join("run");
        state.kill_switch = dir.join(".pipeline-kill");
        state
    }

    fn passing_result(name: &str, cost: f64) -> PhaseResult {
        PhaseResult {
            name: name.to_string(),
            cost_usd: cost,
            turns: 5,
            verdict: Verdict::Pass,
            satisfaction_score: 0.8,
            session_id: format!("sess-{name}"),
            error: None,
        }
    }

    #[test]
    fn test_record_accumulates_cost() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        state.record(passing_result("phase0", 1.5));
        state.record(passing_result("interrogate", 2.25));
        assert_eq!(state.total_cost, 3.75);
        assert_eq!(state.phases.len(), 2);
    }

    #[test]
    fn test_kill_switch_check() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        assert!(state.check_kill_switch().is_ok());
        std::fs::write(&state.kill_switch, "").unwrap();
        assert!(matches!(
            state.check_kill_switch().unwrap_err(),
            PipelineError::KillSwitch(_)
        ));
    }

    #[test]
    fn test_cost_ceiling_check() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        state.max_cost = 10.0;
        state.total_cost = 10.0;
        assert!(state.check_cost_ceiling().is_ok());
        state.total_cost = 10.01;
        assert!(matches!(
            state.check_cost_ceiling().unwrap_err(),
            PipelineError::CostCeiling { .. }
        ));
    }

    #[test]
    fn test_checkpoint_round_trip_via_resume() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        state.record(passing_result("phase0", 1.0));
        state.record(passing_result("interrogate", 2.0));
        state.current_phase = "interrogation-review".to_string();
        state.save_checkpoint().unwrap();

        let resumed = PipelineState::resume(&state.log_dir, &PipelineConfig::empty()).unwrap();
        assert_eq!(resumed.ticket, "TICKET-1");
        assert_eq!(resumed.total_cost, 3.0);
        assert_eq!(resumed.resume_from.as_deref(), Some("interrogation-review"));
        assert_eq!(resumed.status, RunStatus::Running);
        assert!(resumed.is_completed("phase0"));
        assert!(resumed.is_completed("interrogate"));
        assert!(!resumed.is_completed("interrogation-review"));
    }

    #[test]
    fn test_resume_missing_checkpoint_errors() {
        let dir = tempdir().unwrap();
        let result = PipelineState::resume(dir.path(), &PipelineConfig::empty());
        assert!(result.is_err());
    }

    #[test]
    fn test_costs_ledger_sums_match_total() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        state.record(passing_result("phase0", 1.0));
        state.record(passing_result("implement-step-1-attempt-1", 4.0));
        state.save_costs().unwrap();

        let content = std::fs::read_to_string(state.costs_path()).unwrap();
        let ledger: CostLedger = serde_json::from_str(&content).unwrap();
        let sum: f64 = ledger.phases.iter().map(|p| p.cost).sum();
        assert_eq!(sum, ledger.total_cost);
        assert_eq!(ledger.started, "phase0");
    }

    #[test]
    fn test_costs_ledger_empty_run_started_unknown() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        state.save_costs().unwrap();
        let ledger: CostLedger =
            serde_json::from_str(&std::fs::read_to_string(state.costs_path()).unwrap()).unwrap();
        assert_eq!(ledger.started, "unknown");
        assert_eq!(ledger.total_cost, 0.0);
    }

    #[test]
    fn test_retry_count_matches_attempt_pattern() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path());
        state.record(passing_result("implement-step-1-attempt-1", 1.0));
        state.record(passing_result("verify-step-1-attempt-1", 1.0));
        state.record(passing_result("implement-step-1-attempt-2", 1.0));
        state.record(passing_result("verify-step-1-attempt-2", 1.0));
        state.record(passing_result("ship", 1.0));
        assert_eq!(state.retry_count(), 2);
    }

    #[test]
    fn test_metrics_append_accumulates_entries() {
        let dir = tempdir().unwrap();
        let metrics = dir.path().join("metrics.json");

        let mut state = test_state(dir.path());
        state.status = RunStatus::Completed;
        state.tier = Some(Tier::Full);
        state.record(passing_result("phase0", 1.0));
        state.append_metrics(&metrics).unwrap();

        let state2 = test_state(dir.path());
        state2.append_metrics(&metrics).unwrap();

        let entries: Vec<MetricsEntry> =
            serde_json::from_str(&std::fs::read_to_string(&metrics).unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tier, "full");
        assert_eq!(entries[0].final_status, RunStatus::Completed);
        assert_eq!(entries[1].tier, "unresolved");
    }

    #[test]
    fn test_metrics_survives_corrupt_file() {
        let dir = tempdir().unwrap();
        let metrics = dir.path().join("metrics.json");
        std::fs::write(&metrics, "not json").unwrap();

        let state = test_state(dir.path());
        state.append_metrics(&metrics).unwrap();

        let entries: Vec<MetricsEntry> =
            serde_json::from_str(&std::fs::read_to_string(&metrics).unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_error_result_has_unknown_verdict() {
        let result = PhaseResult::errored("verify-step-1-attempt-1", "Timeout after 300s");
        assert!(result.is_error());
        assert_eq!(result.verdict, Verdict::Unknown);
        assert_eq!(result.cost_usd, 0.0);
        assert_eq!(result.satisfaction_score, 0.0);
    }

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::StalledNoProgress).unwrap(),
            "\"stalled_no_progress\""
        );
        let status: RunStatus = serde_json::from_str("\"needs_human_gate\"").unwrap();
        assert_eq!(status, RunStatus::NeedsHumanGate);
    }
}
