//! Verdict parsing from agent output.
//!
//! Routing decisions hang off two things the engine is allowed to read out
//! of otherwise-opaque agent text: a trailing `VERDICT: <TOKEN>` line and an
//! optional `"aggregate": <float>` satisfaction score.

use crate::config::Thresholds;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static AGGREGATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""aggregate"\s*:\s*([0-9][0-9.]*)"#).unwrap());

/// Verdict tokens an agent can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    AutoPass,
    Pass,
    PassWithNotes,
    Iterate,
    Fail,
    Block,
    NeedsHuman,
    Unknown,
}

impl Verdict {
    pub fn from_token(token: &str) -> Self {
        match token {
            "AUTO_PASS" => Verdict::AutoPass,
            "PASS" => Verdict::Pass,
            "PASS_WITH_NOTES" => Verdict::PassWithNotes,
            "ITERATE" => Verdict::Iterate,
            "FAIL" => Verdict::Fail,
            "BLOCK" => Verdict::Block,
            "NEEDS_HUMAN" => Verdict::NeedsHuman,
            _ => Verdict::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::AutoPass => "AUTO_PASS",
            Verdict::Pass => "PASS",
            Verdict::PassWithNotes => "PASS_WITH_NOTES",
            Verdict::Iterate => "ITERATE",
            Verdict::Fail => "FAIL",
            Verdict::Block => "BLOCK",
            Verdict::NeedsHuman => "NEEDS_HUMAN",
            Verdict::Unknown => "UNKNOWN",
        }
    }

    /// Any of the three pass variants.
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::AutoPass | Verdict::Pass | Verdict::PassWithNotes)
    }

    /// Strictness rank used when reconciling disagreeing reviews:
    /// FAIL > ITERATE > NEEDS_HUMAN > PASS_WITH_NOTES > PASS > AUTO_PASS.
    /// BLOCK outranks everything; UNKNOWN sits between the failing and
    /// passing groups so an unparseable pass never wins a reconciliation.
    pub fn strictness(&self) -> u8 {
        match self {
            Verdict::Block => 7,
            Verdict::Fail => 6,
            Verdict::Iterate => 5,
            Verdict::NeedsHuman => 4,
            Verdict::Unknown => 3,
            Verdict::PassWithNotes => 2,
            Verdict::Pass => 1,
            Verdict::AutoPass => 0,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the verdict from agent output.
///
/// Scans lines from last to first; the first line containing `VERDICT:`
/// yields the token after its last occurrence, truncated at whitespace.
pub fn parse_verdict(text: &str) -> Verdict {
    for line in text.lines().rev() {
        if let Some(idx) = line.rfind("VERDICT:") {
            let tail = &line[idx + "VERDICT:".len()..];
            let token = tail.trim().split_whitespace().next().unwrap_or("");
            return Verdict::from_token(token);
        }
    }
    Verdict::Unknown
}

/// Extract the aggregate satisfaction score from agent output, else 0.0.
pub fn parse_satisfaction(text: &str) -> f64 {
    AGGREGATE_REGEX
        .captures(text)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0)
}

/// Map a satisfaction score to a verdict using the configured thresholds.
pub fn score_to_verdict(score: f64, thresholds: &Thresholds) -> Verdict {
    if score >= thresholds.auto_pass {
        Verdict::AutoPass
    } else if score >= thresholds.pass {
        Verdict::PassWithNotes
    } else if score >= thresholds.iterate {
        Verdict::Iterate
    } else {
        Verdict::Block
    }
}
