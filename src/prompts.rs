//! Prompt templates for every pipeline phase.
//!
//! The orchestration engine treats all of this as opaque payload: it routes
//! on verdicts, not on prompt content. Each builder returns the full prompt
//! text for one phase.

use std::path::Path;

use crate::implement::ImplStep;

/// Instruction appended to a second review pass so the two passes cannot
/// share a reading-order bias.
pub const REVERSE_ORDER_INSTRUCTION: &str = "\n\nBIAS CHECK - SECOND PASS: You are an independent \
second reviewer. Read the material in REVERSE section order (last section first). Do not assume \
the first review was correct. Score from scratch.";

pub fn phase0() -> String {
    "You are running the delivery pipeline autonomously. \
     Read CLAUDE.md first, then execute the phase0 context scan: scan git state, \
     check memory for prior pipeline state, identify project type, TODOs, test status, blockers. \
     Estimate change scope as 'SCOPE: <1-5>' (1=trivial, 5=major). \
     Write a phase0-summary.md to docs/summaries/. Output must be under 20 lines."
        .to_string()
}

pub fn interrogate(ticket: &str) -> String {
    format!(
        "Autonomous interrogation for ticket: {ticket}. AUTONOMOUS_MODE=true. \
         Read CLAUDE.md, then docs/summaries/phase0-summary.md. \
         Execute the full interrogation protocol (all 13 sections). For each section: \
         1. Search knowledge sources 2. Search codebase 3. Assume with [ASSUMPTION] tags if needed. \
         Write transcript to docs/artifacts/ and pyramid summary to docs/summaries/interrogation-summary.md."
    )
}

pub fn interrogate_retry(iteration: u32) -> String {
    format!(
        "Re-run interrogation (iteration {iteration}) addressing gaps flagged in \
         docs/summaries/interrogation-review.md. Focus on sections that scored below 3. \
         Update the transcript and the pyramid summary in place."
    )
}

pub fn interrogation_review() -> String {
    "You are a REVIEWER agent. You did NOT write the interrogation output. \
     Read docs/summaries/interrogation-summary.md. Score each section 1-5. \
     Calculate overall satisfaction as \"aggregate\" decimal. \
     Output VERDICT: PASS|ITERATE|NEEDS_HUMAN as the last line."
        .to_string()
}

pub fn generate_docs(templates_dir: &Path) -> String {
    format!(
        "Generate all applicable documents from {}. \
         Read docs/summaries/interrogation-summary.md for requirements. \
         Write each to docs/[name].md. After all docs: write docs/summaries/documentation-summary.md.",
        templates_dir.display()
    )
}

pub fn generate_docs_retry() -> String {
    "Re-generate docs addressing gaps from the doc review. Focus on flagged sections. \
     Update docs/summaries/documentation-summary.md afterwards."
        .to_string()
}

pub fn doc_review() -> String {
    "You are a REVIEWER agent. Review generated docs for completeness. \
     Spot-check docs/PRD.md, docs/IMPLEMENTATION_PLAN.md, docs/TESTING_PLAN.md. \
     Score satisfaction as \"aggregate\" decimal. If >= 80%: VERDICT: PASS. \
     If < 80%: VERDICT: ITERATE. Always include VERDICT as the last line."
        .to_string()
}

pub fn write_specs(summaries_dir: &Path) -> String {
    format!(
        "You are the SPEC WRITER agent. Read docs/IMPLEMENTATION_PLAN.md and docs/TESTING_PLAN.md. \
         For each implementation step, write failing executable specs (RED) without any \
         implementation. Do not make the specs pass. \
         When done, write {}/spec-writer-summary.md listing every spec file and the step it covers.",
        summaries_dir.display()
    )
}

pub fn holdout_generate(holdouts_dir: &Path) -> String {
    format!(
        "You are the HOLDOUT GENERATOR agent in COMPLETE ISOLATION from implementation. \
         Read docs/PRD.md, docs/APP_FLOW.md, docs/API_SPEC.md, docs/DATA_MODELS.md. \
         Generate 8-12 adversarial test scenarios. Write each to {}/holdout-NNN-[slug].md.",
        holdouts_dir.display()
    )
}

pub fn holdout_validate(holdouts_dir: &Path) -> String {
    format!(
        "You are a HOLDOUT VALIDATION agent. Test the implementation against hidden scenarios. \
         Read each file in {}/holdout-*.md. For each scenario: check preconditions, \
         walk through steps against actual code, evaluate acceptance criteria. \
         Score: (satisfied / total) as percentage. \
         If >= 80% and 0 anti-pattern flags: VERDICT: PASS. \
         If < 80%: VERDICT: FAIL. Always include VERDICT as last line.",
        holdouts_dir.display()
    )
}

pub fn extract_steps() -> String {
    "Read docs/IMPLEMENTATION_PLAN.md and output ONLY a JSON array of step objects: \
     [{\"id\": \"step-1\", \"title\": \"...\", \"description\": \"...\"}]. \
     Output valid JSON only, no markdown fences."
        .to_string()
}

pub fn implement_step(
    step: &ImplStep,
    error_context: &str,
    specs_prewritten: bool,
    summaries_dir: &Path,
) -> String {
    let bdd_instruction = if specs_prewritten {
        format!(
            "Specs for this step were pre-written by an isolated spec writer \
             (see {}/spec-writer-summary.md). Run them, watch them fail, then do \
             GREEN + REFACTOR only: make the existing specs pass without editing them.",
            summaries_dir.display()
        )
    } else {
        "Follow RED/GREEN/REFACTOR: write failing specs for this step first, \
         then implement until they pass, then refactor."
            .to_string()
    };

    format!(
        "You are implementing step {id}: {title}\n\n\
         Read CLAUDE.md for rules. Read {summaries}/documentation-summary.md for context.\n\
         Read the specific doc sections relevant to this step.\n\n\
         Description: {description}\n\n\
         {error_context}\n\n\
         {bdd_instruction}\n\
         Implement this step. Follow existing codebase patterns. Type everything. Handle all errors.\n\
         After implementation, run the project's type checker and linter to verify your changes compile.\n\
         Commit your changes with message: 'feat({id}): {title}'",
        id = step.id,
        title = step.title,
        description = step.description,
        summaries = summaries_dir.display(),
    )
}

pub fn verify_step(step: &ImplStep, fast: bool) -> String {
    let test_instruction = if fast {
        "Run scripts/agent-test.sh if it exists, otherwise run the project's test command"
    } else {
        "Run the FULL test suite (not sampled)"
    };

    format!(
        "You are a VERIFICATION agent. Verify that step {id} ({title}) was implemented correctly.\n\n\
         Run all relevant checks in order (stop on first failure):\n\
         1. Type checking (tsc --noEmit / mypy / go vet / cargo clippy)\n\
         2. Linting (eslint / ruff / golint)\n\
         3. Tests: {test_instruction}\n\
         4. Build (npm run build / go build / cargo build)\n\n\
         If ALL pass: output VERDICT: PASS\n\
         If ANY fail: output VERDICT: FAIL with the specific error (first 50 lines only)\n\n\
         Always include VERDICT: [PASS|FAIL] as the last line.",
        id = step.id,
        title = step.title,
    )
}

pub fn security_audit() -> String {
    "You are a SECURITY AUDITOR. Scan all source files for: \
     hardcoded secrets, SQL/XSS/command injection, missing auth checks, \
     insecure defaults, missing input validation, sensitive data in logs. \
     Severity: BLOCKER | WARNING | INFO. \
     If 0 BLOCKERs: VERDICT: PASS. If any BLOCKERs: VERDICT: FAIL. \
     Always include VERDICT as last line."
        .to_string()
}

pub fn security_fix(audit_artifact: &Path) -> String {
    format!(
        "Read {}. Fix all BLOCKER-severity issues. \
         Do not change functionality. Commit with message 'fix(security): address audit findings'",
        audit_artifact.display()
    )
}

pub fn ship(ticket: &str) -> String {
    format!(
        "You are running the final SHIP phase.\n\n\
         Pre-flight checks:\n\
         1. Run full test suite one final time\n\
         2. Verify all implementation steps are committed\n\
         3. Verify no uncommitted changes\n\n\
         If all pass, create a PR:\n\
         - Title: '{ticket}: [generated title from PRD]'\n\
         - Body: built from docs/summaries/ (executive sections only)\n\
         Push branch and create PR via gh CLI. Output the PR URL as the last line."
    )
}
