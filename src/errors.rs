//! Typed error hierarchy for the Anvil pipeline.
//!
//! `PipelineError` covers every terminal condition the driver can hit. Each
//! variant maps to a process exit code via [`PipelineError::exit_code`]:
//! 1 = generic failure, 2 = human input required, 3 = implementation step
//! blocked, 4 = holdout validation failed.

use std::path::PathBuf;
use thiserror::Error;

/// Terminal pipeline conditions.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Kill switch activated: {0}")]
    KillSwitch(PathBuf),

    #[error("Cost ceiling exceeded: ${spent:.2} > ${ceiling:.2}")]
    CostCeiling { spent: f64, ceiling: f64 },

    #[error("Phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("No git progress for {count} consecutive attempts on {phase}")]
    NoProgress { phase: String, count: u32 },

    #[error("Step {step} blocked after {attempts} verification attempts")]
    StepBlocked { step: String, attempts: u32 },

    #[error("Holdout validation failed")]
    HoldoutFailed,

    #[error("Human input needed at gate {gate}")]
    NeedsHuman { gate: String },

    #[error("Phase {phase} is waiting for a human approval marker")]
    HumanGateRequired { phase: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::NeedsHuman { .. } | PipelineError::HumanGateRequired { .. } => 2,
            PipelineError::StepBlocked { .. } => 3,
            PipelineError::HoldoutFailed => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(PipelineError::KillSwitch(PathBuf::from(".kill")).exit_code(), 1);
        assert_eq!(
            PipelineError::CostCeiling { spent: 51.0, ceiling: 50.0 }.exit_code(),
            1
        );
        assert_eq!(
            PipelineError::NeedsHuman { gate: "interrogation-review".into() }.exit_code(),
            2
        );
        assert_eq!(
            PipelineError::HumanGateRequired { phase: "doc-review".into() }.exit_code(),
            2
        );
        assert_eq!(
            PipelineError::StepBlocked { step: "step-3".into(), attempts: 3 }.exit_code(),
            3
        );
        assert_eq!(PipelineError::HoldoutFailed.exit_code(), 4);
    }

    #[test]
    fn cost_ceiling_message_carries_amounts() {
        let err = PipelineError::CostCeiling { spent: 50.5, ceiling: 50.0 };
        let msg = err.to_string();
        assert!(msg.contains("50.50"));
        assert!(msg.contains("50.00"));
    }

    #[test]
    fn step_blocked_is_matchable() {
        let err = PipelineError::StepBlocked { step: "step-2".into(), attempts: 3 };
        match &err {
            PipelineError::StepBlocked { step, attempts } => {
                assert_eq!(step, "step-2");
                assert_eq!(*attempts, 3);
            }
            _ => panic!("Expected StepBlocked variant"),
        }
    }

    #[test]
    fn anyhow_errors_convert_to_generic_failure() {
        let err: PipelineError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("disk full"));
    }
}
