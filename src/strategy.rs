//! Revision strategies and their constraints.
//!
//! Each failure kind maps to a weighted list of candidate strategies; the
//! selector picks the first untried candidate, degrades to `refactor` on
//! late iterations, and falls back to the top-weighted candidate once
//! everything has been tried. Constraints bound what the worker may do on
//! the retry (file count, LOC delta, forbidden moves) and which previously
//! passed stages must be preserved.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::FailureKind;

/// A named revision plan with bounded blast radius.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionStrategy {
    MinimalFix,
    Refactor,
    RevertAndPatch,
    LspSymbolFirst,
    SpecAlignmentFirst,
    SecurityFix,
}

impl RevisionStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RevisionStrategy::MinimalFix => "minimal_fix",
            RevisionStrategy::Refactor => "refactor",
            RevisionStrategy::RevertAndPatch => "revert_and_patch",
            RevisionStrategy::LspSymbolFirst => "lsp_symbol_first",
            RevisionStrategy::SpecAlignmentFirst => "spec_alignment_first",
            RevisionStrategy::SecurityFix => "security_fix",
        }
    }
}

impl fmt::Display for RevisionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How strictly `preserve_stages` binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreserveAnchor {
    /// Regressing a preserved stage is a strategy violation.
    Hard,
    /// Regression is tolerated when the worker declares it intended.
    Soft,
}

/// Constraints bounding a revision attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConstraints {
    pub max_files_touched: usize,
    pub max_loc_delta: usize,
    pub forbidden: Vec<String>,
    pub preserve_stages: Vec<String>,
    pub preserve_stages_anchor: PreserveAnchor,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// The constraint table for a strategy.
#[must_use]
pub fn constraints_for(strategy: RevisionStrategy) -> StrategyConstraints {
    match strategy {
        RevisionStrategy::MinimalFix => StrategyConstraints {
            max_files_touched: 1,
            max_loc_delta: 30,
            forbidden: strings(&["extract_module", "rename_symbol"]),
            preserve_stages: strings(&["lint", "security"]),
            preserve_stages_anchor: PreserveAnchor::Hard,
        },
        RevisionStrategy::Refactor => StrategyConstraints {
            max_files_touched: 5,
            max_loc_delta: 200,
            forbidden: Vec::new(),
            preserve_stages: Vec::new(),
            preserve_stages_anchor: PreserveAnchor::Soft,
        },
        RevisionStrategy::RevertAndPatch => StrategyConstraints {
            max_files_touched: 1,
            max_loc_delta: 50,
            forbidden: Vec::new(),
            preserve_stages: strings(&["lint"]),
            preserve_stages_anchor: PreserveAnchor::Hard,
        },
        RevisionStrategy::LspSymbolFirst => StrategyConstraints {
            max_files_touched: 2,
            max_loc_delta: 40,
            forbidden: Vec::new(),
            preserve_stages: strings(&["lint"]),
            preserve_stages_anchor: PreserveAnchor::Hard,
        },
        RevisionStrategy::SpecAlignmentFirst => StrategyConstraints {
            max_files_touched: 2,
            max_loc_delta: 60,
            forbidden: Vec::new(),
            preserve_stages: strings(&["lint", "security"]),
            preserve_stages_anchor: PreserveAnchor::Hard,
        },
        RevisionStrategy::SecurityFix => StrategyConstraints {
            max_files_touched: 1,
            max_loc_delta: 25,
            forbidden: strings(&["refactor", "extract_module"]),
            preserve_stages: strings(&["lint"]),
            preserve_stages_anchor: PreserveAnchor::Hard,
        },
    }
}

/// A weighted strategy candidate with its rationale tag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StrategyCandidate {
    pub strategy: RevisionStrategy,
    pub weight: f64,
    pub why: &'static str,
}

const fn cand(strategy: RevisionStrategy, weight: f64, why: &'static str) -> StrategyCandidate {
    StrategyCandidate {
        strategy,
        weight,
        why,
    }
}

/// Candidate strategies for a failure kind, ordered by weight.
#[must_use]
pub fn candidates_for(failure: Option<FailureKind>) -> &'static [StrategyCandidate] {
    const LINT: &[StrategyCandidate] = &[
        cand(RevisionStrategy::MinimalFix, 0.8, "lint"),
        cand(RevisionStrategy::Refactor, 0.2, "fallback"),
    ];
    const SECURITY: &[StrategyCandidate] = &[
        cand(RevisionStrategy::SecurityFix, 0.7, "security"),
        cand(RevisionStrategy::MinimalFix, 0.2, "security"),
        cand(RevisionStrategy::RevertAndPatch, 0.1, "security"),
    ];
    const LSP: &[StrategyCandidate] = &[
        cand(RevisionStrategy::LspSymbolFirst, 0.8, "lsp"),
        cand(RevisionStrategy::MinimalFix, 0.2, "fallback"),
    ];
    const RUNTIME: &[StrategyCandidate] = &[
        cand(RevisionStrategy::Refactor, 0.5, "runtime"),
        cand(RevisionStrategy::RevertAndPatch, 0.5, "runtime"),
    ];
    const SPEC: &[StrategyCandidate] = &[cand(RevisionStrategy::SpecAlignmentFirst, 0.9, "spec")];
    const DEFAULT: &[StrategyCandidate] = &[
        cand(RevisionStrategy::MinimalFix, 0.6, "default"),
        cand(RevisionStrategy::Refactor, 0.4, "fallback"),
    ];
    match failure {
        Some(FailureKind::Lint) => LINT,
        Some(FailureKind::Security) => SECURITY,
        Some(FailureKind::Lsp) => LSP,
        Some(FailureKind::Runtime) => RUNTIME,
        Some(FailureKind::SpecMismatch) => SPEC,
        // Gate rejections never select a strategy; callers map them away
        // before reaching here, so they share the default table.
        Some(FailureKind::IntegrityGate) | None => DEFAULT,
    }
}

/// Select the strategy for the next revision attempt.
///
/// Rules, in order:
/// 1. late-iteration degradation: when the next attempt would be the last
///    and `refactor` is an untried candidate, prefer it;
/// 2. the first candidate not in `tried`;
/// 3. all tried → the top-weighted candidate.
#[must_use]
pub fn select_strategy(
    failure: Option<FailureKind>,
    tried: &[RevisionStrategy],
    iteration: u32,
    max_iterations: u32,
) -> RevisionStrategy {
    let candidates = candidates_for(failure);
    let late = iteration + 1 >= max_iterations.saturating_sub(1).max(2);
    if late && !tried.contains(&RevisionStrategy::Refactor) {
        if let Some(c) = candidates
            .iter()
            .find(|c| c.strategy == RevisionStrategy::Refactor)
        {
            return c.strategy;
        }
    }
    candidates
        .iter()
        .find(|c| !tried.contains(&c.strategy))
        .or_else(|| candidates.first())
        .map(|c| c.strategy)
        .unwrap_or(RevisionStrategy::MinimalFix)
}

/// Whether failing `stage` on this attempt violates the active strategy.
///
/// A violation requires a hard anchor, the stage in the preserve list, a
/// prior pass recorded in `stages_passed`, and no declared regression for
/// that stage.
#[must_use]
pub fn is_strategy_violation(
    constraints: &StrategyConstraints,
    stages_passed: &[String],
    failed_stage: &str,
    regressions_intended: &[String],
) -> bool {
    constraints.preserve_stages_anchor == PreserveAnchor::Hard
        && constraints.preserve_stages.iter().any(|s| s == failed_stage)
        && stages_passed.iter().any(|s| s == failed_stage)
        && !regressions_intended.iter().any(|s| s == failed_stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lint_prefers_minimal_fix() {
        let s = select_strategy(Some(FailureKind::Lint), &[], 0, 3);
        assert_eq!(s, RevisionStrategy::MinimalFix);
    }

    #[test]
    fn tried_strategies_are_skipped() {
        let s = select_strategy(
            Some(FailureKind::Lint),
            &[RevisionStrategy::MinimalFix],
            0,
            4,
        );
        assert_eq!(s, RevisionStrategy::Refactor);
    }

    #[test]
    fn late_iteration_degrades_to_refactor() {
        // Next attempt is the last allowed one; refactor is available for
        // runtime failures and untried.
        let s = select_strategy(Some(FailureKind::Runtime), &[], 2, 3);
        assert_eq!(s, RevisionStrategy::Refactor);
    }

    #[test]
    fn exhausted_candidates_fall_back_to_top_weight() {
        let tried = [RevisionStrategy::MinimalFix, RevisionStrategy::Refactor];
        let s = select_strategy(Some(FailureKind::Lint), &tried, 0, 5);
        assert_eq!(s, RevisionStrategy::MinimalFix);
    }

    #[test]
    fn violation_requires_hard_anchor_and_prior_pass() {
        let hard = constraints_for(RevisionStrategy::MinimalFix);
        let soft = constraints_for(RevisionStrategy::Refactor);
        let passed = vec!["lint".to_string()];
        assert!(is_strategy_violation(&hard, &passed, "lint", &[]));
        assert!(!is_strategy_violation(&soft, &passed, "lint", &[]));
        assert!(!is_strategy_violation(&hard, &[], "lint", &[]));
    }

    #[test]
    fn declared_regression_waives_violation() {
        let hard = constraints_for(RevisionStrategy::MinimalFix);
        let passed = vec!["lint".to_string()];
        let declared = vec!["lint".to_string()];
        assert!(!is_strategy_violation(&hard, &passed, "lint", &declared));
    }

    #[test]
    fn constraint_table_matches_design() {
        let c = constraints_for(RevisionStrategy::SecurityFix);
        assert_eq!(c.max_files_touched, 1);
        assert_eq!(c.max_loc_delta, 25);
        assert!(c.forbidden.iter().any(|m| m == "refactor"));
        assert_eq!(c.preserve_stages, vec!["lint"]);
    }
}
