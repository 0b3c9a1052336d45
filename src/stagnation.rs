//! Stagnation detection across retry attempts.
//!
//! Two consecutive retry outputs that are byte-identical (digest match) or
//! nearly identical (character similarity above the threshold) mean the
//! agent is spinning; the retry prompt then asks for a different approach.

use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// LCS is quadratic; inputs are capped before comparison.
const MAX_COMPARED_CHARS: usize = 8_192;

#[derive(Debug, Clone, Copy)]
pub struct StagnationDetector {
    threshold: f64,
}

impl StagnationDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Compare the saved outputs of two consecutive attempts. Missing
    /// files (fewer than two attempts) never count as stagnation.
    pub fn is_stagnant(&self, previous: &Path, current: &Path) -> bool {
        let (Ok(prev), Ok(curr)) = (
            std::fs::read_to_string(previous),
            std::fs::read_to_string(current),
        ) else {
            return false;
        };

        if Sha256::digest(prev.as_bytes()) == Sha256::digest(curr.as_bytes()) {
            debug!(previous = %previous.display(), "attempt outputs are identical");
            return true;
        }

        let ratio = similarity_ratio(&prev, &curr);
        debug!(ratio, threshold = self.threshold, "attempt similarity");
        ratio >= self.threshold
    }
}

/// Character-level similarity in [0, 1]: `2 * LCS / (len_a + len_b)`.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().take(MAX_COMPARED_CHARS).collect();
    let b: Vec<char> = b.chars().take(MAX_COMPARED_CHARS).collect();

    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let lcs = lcs_length(&a, &b);
    (2.0 * lcs as f64) / ((a.len() + b.len()) as f64)
}

fn lcs_length(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
