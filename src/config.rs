//! Shell-style configuration for the pipeline.
//!
//! The config file is a sequence of `KEY=VALUE` lines (the same file the
//! wrapper shell scripts source), so the parser accepts a shell subset:
//! blank lines and `#` comments are discarded, control-flow lines are
//! ignored, and values may carry one layer of single or double quotes.
//! Typed accessors fall back to a default on a missing key or a parse
//! failure; they never error.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_MAX_COST: f64 = 50.0;
pub const DEFAULT_MAX_VERIFY_RETRIES: u32 = 3;
pub const DEFAULT_MAX_INTERROGATION_ITERATIONS: u32 = 2;
pub const DEFAULT_MAX_NO_PROGRESS: u32 = 3;
pub const DEFAULT_STAGNATION_SIMILARITY_PERCENT: i64 = 90;
pub const DEFAULT_LOG_BASE_DIR: &str = "docs/artifacts/pipeline-runs";
pub const DEFAULT_KILL_SWITCH_FILE: &str = ".pipeline-kill";
pub const DEFAULT_METRICS_FILE: &str = "docs/artifacts/pipeline-metrics.json";
pub const DEFAULT_HOLDOUTS_DIR: &str = ".holdouts";
pub const DEFAULT_SUMMARIES_DIR: &str = "docs/summaries";
pub const DEFAULT_ARTIFACTS_DIR: &str = "docs/artifacts";
pub const DEFAULT_TEMPLATES_DIR: &str = "docs/templates";
pub const DEFAULT_DOCS_DIR: &str = "docs";
pub const DEFAULT_AGENT_COMMAND: &str = "claude-agent";

// Retry/versioning suffixes are stripped from a phase name before the
// per-phase TIMEOUT_/MODEL_ lookup, so `verify-step-2-attempt-1` resolves
// through `TIMEOUT_VERIFY`.
static ATTEMPT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-attempt-\d+$").unwrap());
static PASS_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-pass\d+$").unwrap());
static VERSION_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-v\d+$").unwrap());
static STEP_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-step-.*$").unwrap());

/// Score thresholds for mapping a satisfaction score to a verdict,
/// stored as fractions in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub auto_pass: f64,
    pub pass: f64,
    pub iterate: f64,
}

/// Parsed pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    values: HashMap<String, String>,
}

impl PipelineConfig {
    /// Load and parse a config file. A missing file is an error; an empty
    /// file yields an empty config (all accessors return defaults).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    /// Parse config content line by line.
    pub fn parse(content: &str) -> Self {
        let mut values = HashMap::new();

        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with("for ") || line.starts_with("if ") {
                continue;
            }
            let Some(eq) = line.find('=') else {
                continue;
            };

            let key = line[..eq].trim();
            if !is_identifier(key) {
                continue;
            }

            let value = strip_quotes(line[eq + 1..].trim());
            values.insert(key.to_string(), value.to_string());
        }

        Self { values }
    }

    /// Create an empty config (defaults only).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set a single key, replacing any existing value.
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn float(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Comma-separated list; entries are trimmed and empties dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A percentage integer stored as a fraction, e.g. `90` becomes `0.9`.
    pub fn percent(&self, key: &str, default_percent: i64) -> f64 {
        self.int(key, default_percent) as f64 / 100.0
    }

    // --- Derived accessors used across the pipeline ---

    /// Phase name with retry/version suffixes (`-attempt-N`, `-passN`,
    /// `-vN`) stripped.
    pub fn base_phase_name(phase: &str) -> String {
        let base = ATTEMPT_SUFFIX.replace(phase, "");
        let base = PASS_SUFFIX.replace(&base, "");
        let base = VERSION_SUFFIX.replace(&base, "");
        base.into_owned()
    }

    /// Canonical lookup key for a phase name: retry/version suffixes and
    /// step slugs stripped, dashes to underscores, uppercased.
    pub fn phase_key(phase: &str) -> String {
        let base = Self::base_phase_name(phase);
        let base = STEP_SUFFIX.replace(&base, "");
        base.replace('-', "_").to_uppercase()
    }

    /// Wall-clock timeout for a phase: `TIMEOUT_<KEY>`, then
    /// `DEFAULT_TIMEOUT`, then 600 seconds.
    pub fn timeout_for(&self, phase: &str) -> u64 {
        let key = format!("TIMEOUT_{}", Self::phase_key(phase));
        let default = self.int("DEFAULT_TIMEOUT", DEFAULT_TIMEOUT_SECONDS as i64);
        let seconds = self.int(&key, default);
        seconds.max(1) as u64
    }

    /// Model identifier for a phase: `MODEL_<KEY>`, then the given default.
    pub fn model_for(&self, phase: &str, default: &str) -> String {
        let key = format!("MODEL_{}", Self::phase_key(phase));
        self.str(&key, default)
    }

    pub fn max_cost(&self) -> f64 {
        self.float("MAX_PIPELINE_COST", DEFAULT_MAX_COST)
    }

    pub fn max_verify_retries(&self) -> u32 {
        self.int("MAX_VERIFY_RETRIES", DEFAULT_MAX_VERIFY_RETRIES as i64).max(1) as u32
    }

    pub fn max_interrogation_iterations(&self) -> u32 {
        self.int(
            "MAX_INTERROGATION_ITERATIONS",
            DEFAULT_MAX_INTERROGATION_ITERATIONS as i64,
        )
        .max(0) as u32
    }

    pub fn max_no_progress(&self) -> u32 {
        self.int("MAX_NO_PROGRESS", DEFAULT_MAX_NO_PROGRESS as i64).max(1) as u32
    }

    pub fn stagnation_threshold(&self) -> f64 {
        self.percent(
            "STAGNATION_SIMILARITY_THRESHOLD",
            DEFAULT_STAGNATION_SIMILARITY_PERCENT,
        )
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            auto_pass: self.percent("THRESHOLD_AUTO_PASS", 90),
            pass: self.percent("THRESHOLD_PASS", 70),
            iterate: self.percent("THRESHOLD_ITERATE", 50),
        }
    }

    pub fn tier_setting(&self) -> String {
        self.str("PIPELINE_TIER", "standard")
    }

    pub fn phase_order(&self) -> Option<Vec<String>> {
        let order = self.list("PHASE_ORDER");
        if order.is_empty() { None } else { Some(order) }
    }

    pub fn doc_templates_mode(&self) -> String {
        self.str("DOC_TEMPLATES_MODE", "auto")
    }

    pub fn human_gates(&self) -> Vec<String> {
        self.list("HUMAN_GATES")
    }

    pub fn log_base_dir(&self) -> PathBuf {
        PathBuf::from(self.str("LOG_BASE_DIR", DEFAULT_LOG_BASE_DIR))
    }

    pub fn kill_switch_file(&self) -> PathBuf {
        PathBuf::from(self.str("KILL_SWITCH_FILE", DEFAULT_KILL_SWITCH_FILE))
    }

    pub fn metrics_file(&self) -> PathBuf {
        PathBuf::from(self.str("METRICS_FILE", DEFAULT_METRICS_FILE))
    }

    pub fn holdouts_dir(&self) -> PathBuf {
        PathBuf::from(self.str("HOLDOUTS_DIR", DEFAULT_HOLDOUTS_DIR))
    }

    pub fn summaries_dir(&self) -> PathBuf {
        PathBuf::from(self.str("SUMMARIES_DIR", DEFAULT_SUMMARIES_DIR))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        PathBuf::from(self.str("ARTIFACTS_DIR", DEFAULT_ARTIFACTS_DIR))
    }

    pub fn templates_dir(&self) -> PathBuf {
        PathBuf::from(self.str("TEMPLATES_DIR", DEFAULT_TEMPLATES_DIR))
    }

    pub fn docs_dir(&self) -> PathBuf {
        PathBuf::from(self.str("DOCS_DIR", DEFAULT_DOCS_DIR))
    }

    pub fn review_validator_command(&self) -> Option<String> {
        self.get("REVIEW_VALIDATOR_COMMAND")
            .filter(|v| !v.trim().is_empty())
            .map(String::from)
    }

    pub fn agent_command(&self) -> String {
        self.str("AGENT_COMMAND", DEFAULT_AGENT_COMMAND)
    }

    pub fn fidelity_downgrade_threshold(&self) -> i64 {
        self.int("FIDELITY_DOWNGRADE_THRESHOLD", 80_000)
    }

    pub fn fidelity_upgrade_threshold(&self) -> i64 {
        self.int("FIDELITY_UPGRADE_THRESHOLD", 20_000)
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Strip one surrounding layer of matching single or double quotes.
fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}
