//! Phase definition for the pipeline.
//!
//! A [`PhaseConfig`] is one uniquely named agent invocation with budgets and
//! a timeout. Retry attempts get fresh names (`verify-step-2-attempt-2`), so
//! every on-disk artifact is traceable to a single invocation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much of the upstream material the phase prompt should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fidelity {
    Full,
    Truncate,
    SummaryLow,
    SummaryMedium,
    SummaryHigh,
    Compact,
}

/// Fidelity ladder, highest fidelity first. Downgrading moves right.
const FIDELITY_LADDER: [Fidelity; 6] = [
    Fidelity::Full,
    Fidelity::Truncate,
    Fidelity::SummaryLow,
    Fidelity::SummaryMedium,
    Fidelity::SummaryHigh,
    Fidelity::Compact,
];

impl Fidelity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fidelity::Full => "full",
            Fidelity::Truncate => "truncate",
            Fidelity::SummaryLow => "summary:low",
            Fidelity::SummaryMedium => "summary:medium",
            Fidelity::SummaryHigh => "summary:high",
            Fidelity::Compact => "compact",
        }
    }

    fn ladder_index(&self) -> usize {
        FIDELITY_LADDER.iter().position(|f| f == self).unwrap_or(0)
    }
}

impl fmt::Display for Fidelity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Fidelity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Fidelity::Full),
            "truncate" => Ok(Fidelity::Truncate),
            "summary:low" => Ok(Fidelity::SummaryLow),
            "summary:medium" => Ok(Fidelity::SummaryMedium),
            "summary:high" => Ok(Fidelity::SummaryHigh),
            "compact" => Ok(Fidelity::Compact),
            other => Err(format!("unknown fidelity mode: {other}")),
        }
    }
}

/// Pick a fidelity based on an estimated prompt size.
///
/// Public helper for callers that size their own prompts; the driver never
/// invokes it implicitly.
pub fn select_fidelity(
    current: Fidelity,
    estimated_tokens: i64,
    downgrade_threshold: i64,
    upgrade_threshold: i64,
) -> Fidelity {
    let idx = current.ladder_index();
    if estimated_tokens > downgrade_threshold {
        FIDELITY_LADDER[(idx + 1).min(FIDELITY_LADDER.len() - 1)]
    } else if estimated_tokens < upgrade_threshold {
        FIDELITY_LADDER[idx.saturating_sub(1)]
    } else {
        current
    }
}

/// A single agent invocation: prompt, model, budgets, timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseConfig {
    /// Unique name per run attempt; doubles as the artifact file stem.
    pub name: String,
    pub prompt: String,
    pub model: String,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub timeout_seconds: u64,
    pub fidelity: Fidelity,
}

impl PhaseConfig {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            model: "claude-opus-4-6".to_string(),
            max_turns: 25,
            max_budget_usd: 5.0,
            timeout_seconds: 600,
            fidelity: Fidelity::SummaryHigh,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_budget(mut self, max_budget_usd: f64) -> Self {
        self.max_budget_usd = max_budget_usd;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_fidelity(mut self, fidelity: Fidelity) -> Self {
        self.fidelity = fidelity;
        self
    }
}
