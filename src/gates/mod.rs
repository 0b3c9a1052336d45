//! Tier resolution and phase gating.
//!
//! The filter decides whether a phase runs at all: tier skip sets, resume
//! skipping, doc-template mode, and human approval gates all live here. A
//! human gate pauses the run until the operator drops a marker file into
//! the log directory and resumes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::orchestrator::runner::load_artifact;
use crate::orchestrator::state::{PipelineState, RunStatus};

static SCOPE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"SCOPE:\s*([1-9])").unwrap());

/// Default top-level stage ordering; `PHASE_ORDER` overrides it.
pub const DEFAULT_PHASE_ORDER: [&str; 11] = [
    "phase0",
    "interrogate",
    "interrogation-review",
    "generate-docs",
    "doc-review",
    "write-specs",
    "holdout-generate",
    "implement",
    "holdout-validate",
    "security-audit",
    "ship",
];

/// Pipeline tier: which subset of phases to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Nano,
    Quick,
    Standard,
    Full,
}

impl Tier {
    /// Whether this tier skips the given top-level phase.
    pub fn skips(&self, phase: &str) -> bool {
        match self {
            Tier::Nano => matches!(
                phase,
                "interrogation-review"
                    | "generate-docs"
                    | "doc-review"
                    | "write-specs"
                    | "holdout-generate"
                    | "holdout-validate"
                    | "security-audit"
            ),
            Tier::Quick => matches!(
                phase,
                "write-specs" | "holdout-generate" | "holdout-validate" | "security-audit"
            ),
            Tier::Standard => matches!(phase, "holdout-generate" | "holdout-validate"),
            Tier::Full => false,
        }
    }

    /// Map a `SCOPE: <digit>` estimate to a tier.
    pub fn from_scope(scope: u32) -> Tier {
        match scope {
            1 => Tier::Nano,
            2 => Tier::Quick,
            3 => Tier::Standard,
            _ => Tier::Full,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Nano => "nano",
            Tier::Quick => "quick",
            Tier::Standard => "standard",
            Tier::Full => "full",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nano" => Ok(Tier::Nano),
            "quick" => Ok(Tier::Quick),
            "standard" => Ok(Tier::Standard),
            "full" => Ok(Tier::Full),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

pub struct PhaseFilter {
    stage_order: Vec<String>,
    human_gates: Vec<String>,
    doc_mode: String,
    tier_setting: String,
}

impl PhaseFilter {
    pub fn new(config: &PipelineConfig) -> Self {
        let stage_order = match config.phase_order() {
            Some(order) => order
                .into_iter()
                .filter(|stage| {
                    let known = DEFAULT_PHASE_ORDER.contains(&stage.as_str());
                    if !known {
                        warn!(stage, "ignoring unknown stage in PHASE_ORDER");
                    }
                    known
                })
                .collect(),
            None => DEFAULT_PHASE_ORDER.iter().map(|s| s.to_string()).collect(),
        };

        Self {
            stage_order,
            human_gates: config.human_gates(),
            doc_mode: config.doc_templates_mode(),
            tier_setting: config.tier_setting(),
        }
    }

    pub fn stage_order(&self) -> &[String] {
        &self.stage_order
    }

    /// Resolve the pipeline tier, caching it on the state.
    ///
    /// An explicit setting wins. `auto` scans the phase-0 artifact for a
    /// `SCOPE: <digit>` estimate; until that artifact exists the tier stays
    /// unresolved and defaults to standard (which never skips the early
    /// phases), so phase-0 itself is unaffected.
    pub fn resolve_tier(&self, state: &mut PipelineState) -> Tier {
        if let Some(tier) = state.tier {
            return tier;
        }

        if self.tier_setting != "auto" {
            let tier = self.tier_setting.parse().unwrap_or_else(|_| {
                warn!(setting = %self.tier_setting, "invalid PIPELINE_TIER, using standard");
                Tier::Standard
            });
            state.tier = Some(tier);
            return tier;
        }

        match load_artifact(&state.log_dir, "phase0") {
            Ok(artifact) => {
                let tier = SCOPE_REGEX
                    .captures(&artifact.result)
                    .and_then(|cap| cap.get(1))
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .map(Tier::from_scope)
                    .unwrap_or(Tier::Standard);
                info!(%tier, "resolved pipeline tier from scope estimate");
                state.tier = Some(tier);
                tier
            }
            Err(_) => Tier::Standard,
        }
    }

    pub fn tier_allows_phase(&self, state: &mut PipelineState, phase: &str) -> bool {
        !self.resolve_tier(state).skips(phase)
    }

    /// Full gating decision for a top-level phase.
    ///
    /// `Ok(false)` means skip and move on; a human-gate pause surfaces as
    /// an error so the driver can exit with the human-input code.
    pub fn should_run_phase(
        &self,
        state: &mut PipelineState,
        phase: &str,
    ) -> Result<bool, PipelineError> {
        if !self.tier_allows_phase(state, phase) {
            info!(phase, tier = %self.resolve_tier(state), "phase skipped by tier");
            return Ok(false);
        }

        // Resume: everything strictly before the anchor's stage is done.
        if let Some(anchor) = state.resume_from.clone() {
            let anchor_stage = stage_of(&anchor);
            if let (Some(idx), Some(anchor_idx)) =
                (self.stage_index(phase), self.stage_index(&anchor_stage))
                && idx < anchor_idx
            {
                info!(phase, anchor = %anchor, "phase skipped on resume");
                return Ok(false);
            }
        }

        if state.is_completed(phase) {
            info!(phase, "phase already completed");
            return Ok(false);
        }

        if self.doc_mode == "none" && matches!(phase, "generate-docs" | "doc-review") {
            info!(phase, "phase skipped: doc templates disabled");
            return Ok(false);
        }

        if self.human_gates.iter().any(|g| g == phase) {
            let marker = state.log_dir.join(format!("{phase}.human-approved"));
            if !marker.exists() {
                state.status = RunStatus::NeedsHumanGate;
                state.save_checkpoint()?;
                println!(
                    "\n{} Phase {} requires human approval.",
                    console::style("⏸").yellow(),
                    console::style(phase).bold()
                );
                println!("  Create {} and re-run with --resume to continue.", marker.display());
                return Err(PipelineError::HumanGateRequired { phase: phase.to_string() });
            }
            info!(phase, "human gate marker found");
        }

        Ok(true)
    }

    fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stage_order.iter().position(|s| s == stage)
    }
}

/// Map any phase name (including retries and sub-phases) to its top-level
/// stage for resume ordering.
pub fn stage_of(phase: &str) -> String {
    if phase == "extract-steps" || phase.starts_with("implement-") || phase.starts_with("verify-") {
        return "implement".to_string();
    }
    if phase.starts_with("security-fix") {
        return "security-audit".to_string();
    }
    PipelineConfig::base_phase_name(phase)
}
