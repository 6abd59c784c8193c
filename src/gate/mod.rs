//! The integrity gate: deterministic pre-sandbox policy checks.
//!
//! "Is this code permitted?", not "is this code good?". The gate runs the
//! checks in a fixed order and short-circuits on the first failure, which
//! it returns as an [`IntegrityFailure`] carrying actionable remediation
//! text that goes straight into the worker's next prompt. Gate rejections
//! route back through the curator to the worker and never advance the
//! iteration counter.

mod checks;
mod lang;

pub use checks::*;
pub use lang::{family, python_code_lines, python_imports, stripped_code_lines, LangFamily};

use serde::{Deserialize, Serialize};

use crate::state::{ExperimentPlan, PatchOp};
use crate::strategy::StrategyConstraints;

/// Failure categories the gate can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateCategory {
    Secret,
    Network,
    Path,
    Binary,
    Import,
    Workspace,
    Scope,
    Dangerous,
    Size,
}

impl GateCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            GateCategory::Secret => "secret",
            GateCategory::Network => "network",
            GateCategory::Path => "path",
            GateCategory::Binary => "binary",
            GateCategory::Import => "import",
            GateCategory::Workspace => "workspace",
            GateCategory::Scope => "scope",
            GateCategory::Dangerous => "dangerous",
            GateCategory::Size => "size",
        }
    }
}

/// Actionable gate feedback: the worker gets remediation, not a generic
/// error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFailure {
    pub category: GateCategory,
    /// The specific line or symbol that failed.
    pub evidence: String,
    pub remediation: String,
}

impl IntegrityFailure {
    pub fn new(
        category: GateCategory,
        evidence: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        Self {
            category,
            evidence: evidence.into(),
            remediation: remediation.into(),
        }
    }
}

/// Gate limits resolved from settings.
#[derive(Clone, Debug)]
pub struct GateConfig {
    pub target_workspace: String,
    pub max_code_chars: usize,
    pub max_patch_file_chars: usize,
    pub path_denylist: Vec<String>,
    pub trusted_packages: Vec<String>,
    pub experiment_max_commands: usize,
    pub evidence_command_allowlist: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            target_workspace: String::new(),
            max_code_chars: 100_000,
            max_patch_file_chars: 50_000,
            path_denylist: vec![
                "package-lock.json".into(),
                "yarn.lock".into(),
                "Cargo.lock".into(),
                "poetry.lock".into(),
                "pnpm-lock.yaml".into(),
            ],
            trusted_packages: Vec::new(),
            experiment_max_commands: 10,
            evidence_command_allowlist: vec![
                "python".into(),
                "python3".into(),
                "pytest".into(),
                "bash".into(),
                "sh".into(),
                "node".into(),
                "go".into(),
                "cargo".into(),
            ],
        }
    }
}

/// Everything the gate inspects, borrowed from state.
#[derive(Clone, Debug, Default)]
pub struct GateInput<'a> {
    pub code: &'a str,
    pub language: &'a str,
    pub patch_ops: &'a [PatchOp],
    pub files_touched: &'a [String],
    pub unified_diff: Option<&'a str>,
    pub experiment_plan: Option<&'a ExperimentPlan>,
    /// The planner's capability manifest.
    pub touched_files: &'a [String],
    pub revision_constraints: Option<&'a StrategyConstraints>,
}

/// Run every check in order, short-circuiting on the first failure.
///
/// Patch-ops-only submissions get their patch text (plus experiment
/// commands) concatenated for the content checks.
pub fn run_gate(input: &GateInput<'_>, config: &GateConfig) -> Result<(), IntegrityFailure> {
    let has_patch_content = crate::sandbox::has_patch_content(input.patch_ops);
    if input.code.trim().is_empty() && !has_patch_content {
        // Nothing to check; the sandbox stage treats this as a no-op run.
        return Ok(());
    }

    // 1. Workspace boundary.
    check_workspace_boundary(
        input.files_touched,
        input.patch_ops,
        &config.target_workspace,
    )?;
    // 2. Scope allowlist against the planner's manifest.
    check_scope(
        input.files_touched,
        input.patch_ops,
        input.touched_files,
        &config.target_workspace,
    )?;
    // 3. Patch op constraints.
    check_patch_op_constraints(input.patch_ops)?;
    // 4. Per-file patch size.
    check_patch_file_size(input.patch_ops, config.max_patch_file_chars)?;
    // 5. Diff shape against the active strategy.
    if let Some(constraints) = input.revision_constraints {
        check_diff_shape(
            input.files_touched,
            input.patch_ops,
            input.unified_diff,
            constraints,
        )?;
    }
    // 6. Path denylist on declared paths.
    check_denylisted_paths(input.files_touched, input.patch_ops, &config.path_denylist)?;

    let commands = input
        .experiment_plan
        .map(|p| p.commands.as_slice())
        .unwrap_or_default();
    // 7. Evidence blast radius.
    if !commands.is_empty() {
        check_experiment_blast_radius(commands, config.experiment_max_commands)?;
        check_experiment_high_risk(commands)?;
        check_experiment_allowlist(commands, &config.evidence_command_allowlist)?;
    }

    // Combined code view for the content checks.
    let mut combined = if input.code.trim().is_empty() {
        input
            .patch_ops
            .iter()
            .map(|op| op.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        input.code.to_string()
    };
    if !commands.is_empty() {
        combined.push('\n');
        combined.push_str(&commands.join("\n"));
    }

    // The path denylist also applies to write commands hidden in script
    // bodies: lockfile writes via shell redirection.
    check_denylisted_writes(&combined, &config.path_denylist)?;
    // 8. Code size.
    check_max_size(&combined, config.max_code_chars)?;
    // 9. Binary/UTF-8 sanity.
    check_text_sanity(&combined)?;
    // 10. Secrets.
    check_secrets(&combined)?;
    // 11. Network access.
    check_network(&combined, input.language)?;
    // 12. Dangerous shell commands.
    check_dangerous_commands(&combined, input.language)?;
    // 13. Import integrity (Python only).
    check_import_integrity(&combined, input.language, &config.trusted_packages)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PatchAction, PatchOp};

    fn op(path: &str, text: &str) -> PatchOp {
        PatchOp {
            path: path.into(),
            op: PatchAction::Modify,
            text: text.into(),
        }
    }

    fn base_input<'a>(code: &'a str, language: &'a str) -> GateInput<'a> {
        GateInput {
            code,
            language,
            ..Default::default()
        }
    }

    #[test]
    fn clean_python_passes() {
        let input = base_input("print('Hello, world!')\n", "python");
        assert!(run_gate(&input, &GateConfig::default()).is_ok());
    }

    #[test]
    fn empty_submission_passes_through() {
        let input = base_input("", "python");
        assert!(run_gate(&input, &GateConfig::default()).is_ok());
    }

    #[test]
    fn import_requests_is_rejected_but_docstring_is_not() {
        let config = GateConfig::default();
        let bad = base_input("import requests\nrequests.get('http://x')\n", "python");
        let failure = run_gate(&bad, &config).unwrap_err();
        assert_eq!(failure.category, GateCategory::Network);

        let ok = base_input(
            "def f():\n    \"\"\"Example:\n    import requests\n    \"\"\"\n    return 1\n",
            "python",
        );
        assert!(run_gate(&ok, &config).is_ok());
    }

    #[test]
    fn scope_violation_names_replan() {
        let touched = vec!["src/foo.py".to_string()];
        let ops = vec![op("src/bar.py", "x = 1\n")];
        let input = GateInput {
            code: "",
            language: "python",
            patch_ops: &ops,
            touched_files: &touched,
            ..Default::default()
        };
        let failure = run_gate(&input, &GateConfig::default()).unwrap_err();
        assert_eq!(failure.category, GateCategory::Scope);
        assert!(failure.remediation.contains("Re-Plan"));
    }

    #[test]
    fn short_circuits_on_first_failure() {
        // Both a scope violation and a secret; order says scope wins.
        let touched = vec!["src/foo.py".to_string()];
        let ops = vec![op("src/bar.py", "api_key = 'sk_live_abcdef123456'\n")];
        let input = GateInput {
            code: "",
            language: "python",
            patch_ops: &ops,
            touched_files: &touched,
            ..Default::default()
        };
        let failure = run_gate(&input, &GateConfig::default()).unwrap_err();
        assert_eq!(failure.category, GateCategory::Scope);
    }

    #[test]
    fn diff_shape_enforces_strategy_limits() {
        let constraints = crate::strategy::constraints_for(crate::strategy::RevisionStrategy::MinimalFix);
        let ops = vec![op("a.py", "x\n"), op("b.py", "y\n")];
        let files: Vec<String> = vec!["a.py".into(), "b.py".into()];
        let input = GateInput {
            code: "",
            language: "python",
            patch_ops: &ops,
            files_touched: &files,
            revision_constraints: Some(&constraints),
            ..Default::default()
        };
        let failure = run_gate(&input, &GateConfig::default()).unwrap_err();
        assert_eq!(failure.category, GateCategory::Size);
    }
}
