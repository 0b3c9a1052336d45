//! Table-driven routing from gate verdicts.
//!
//! The router is deterministic: a `(gate, verdict)` pair maps to the next
//! phase, a terminal human escalation, or the `verify` loop sentinel. Any
//! key outside the table is an escalation, not an error.

use crate::verdict::Verdict;

/// Action selected by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Advance (or loop back) to the named phase.
    To(&'static str),
    /// Terminal: a human must intervene.
    Blocked,
    /// Verify passed; the caller advances to the next step or, when the
    /// step list is exhausted, to holdout validation.
    NextStepOrHoldout,
}

/// Route from a gate verdict.
///
/// `retries` is only consulted for the `verify` gate, which re-enters
/// `implement` until the retry budget is spent.
pub fn route_from_gate(gate: &str, verdict: Verdict, retries: u32, max_verify_retries: u32) -> Route {
    use Verdict::*;

    if gate == "verify" {
        if verdict.is_pass() {
            return Route::NextStepOrHoldout;
        }
        if retries >= max_verify_retries {
            return Route::Blocked;
        }
        return Route::To("implement");
    }

    match (gate, verdict) {
        ("interrogation-review", AutoPass | PassWithNotes | Pass) => Route::To("generate-docs"),
        ("interrogation-review", Iterate) => Route::To("interrogate"),
        ("interrogation-review", NeedsHuman | Block) => Route::Blocked,

        ("doc-review", AutoPass | PassWithNotes | Pass) => Route::To("holdout-generate"),
        ("doc-review", Iterate) => Route::To("generate-docs"),

        ("holdout-validate", AutoPass | PassWithNotes | Pass) => Route::To("security-audit"),
        ("holdout-validate", Fail) => Route::To("implement"),

        ("security-audit", AutoPass | Pass) => Route::To("ship"),
        ("security-audit", Fail) => Route::To("implement"),

        _ => Route::Blocked,
    }
}
