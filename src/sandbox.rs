//! Sandbox execution contract.
//!
//! The sandbox service runs artifacts in an isolated, network-denied
//! container and returns the structured result in [`SandboxResult`]. This
//! module owns the parts of the contract the core is responsible for:
//! bundling multi-file patch sets into a runnable script, classifying
//! results into a [`FailureKind`], and the canonical apply order that makes
//! patch application independent of emission order.
//!
//! Execution itself goes through [`crate::clients::SandboxClient`]: a
//! pre-warmed worker pool first, with fallthrough to an ephemeral job.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::state::{ExperimentPlan, PatchAction, PatchOp};
use crate::types::FailureKind;

/// A single diagnostic from the lint section or the analysis gateway.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub source: String,
}

/// Lint section of the sandbox result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LintSection {
    pub passed: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl Default for LintSection {
    fn default() -> Self {
        Self {
            passed: true,
            output: String::new(),
            diagnostics: Vec::new(),
        }
    }
}

/// A single security finding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityFinding {
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub message: String,
}

/// Security-scan section of the sandbox result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecuritySection {
    pub passed: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub findings: Vec<SecurityFinding>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            passed: true,
            output: String::new(),
            findings: Vec::new(),
        }
    }
}

/// Execution section of the sandbox result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
}

/// Structured JSON returned by the sandbox service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub lint: LintSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub execution: ExecutionSection,
    /// Top-level transport or parse error, when the result body itself
    /// could not be produced.
    #[serde(default)]
    pub error: Option<String>,
}

/// Exit code the sandbox reports when the artifact hit its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Classify a sandbox result into the failure taxonomy.
///
/// `lsp_diagnostics_present` reflects whether the analyzer stage produced
/// diagnostics earlier in the same iteration; those take precedence over a
/// generic runtime classification.
#[must_use]
pub fn classify_failure(result: &SandboxResult, lsp_diagnostics_present: bool) -> FailureKind {
    if !result.lint.passed {
        FailureKind::Lint
    } else if !result.security.passed {
        FailureKind::Security
    } else if lsp_diagnostics_present {
        FailureKind::Lsp
    } else {
        // Timeout (124) is a runtime failure for strategy purposes.
        FailureKind::Runtime
    }
}

/// Sort patch ops into the canonical apply order: `(path, op)`.
///
/// Applying the sorted ops yields the same final workspace regardless of
/// the order the worker emitted them in.
#[must_use]
pub fn canonical_patch_order(mut ops: Vec<PatchOp>) -> Vec<PatchOp> {
    ops.sort_by(|a, b| a.path.cmp(&b.path).then(a.op.cmp(&b.op)));
    ops
}

/// Bundle a patch set into a runnable shell script.
///
/// Used when the worker produced multi-file `patch_ops` instead of a single
/// script: each op creates its parent directory and writes content via a
/// base64-decoded heredoc (deletes use `rm -f`), then the configured
/// command runs: the language's test runner, or the experiment plan's
/// commands when present. Experiments get a scratch directory under
/// `.synesis/experiments/<attempt_id>/`.
#[must_use]
pub fn bundle_patch_ops(
    ops: &[PatchOp],
    language: &str,
    experiment_plan: Option<&ExperimentPlan>,
    attempt_id: &str,
) -> String {
    if ops.is_empty() {
        return String::new();
    }
    let sorted = canonical_patch_order(ops.to_vec());
    let mut parts = vec![
        "#!/bin/bash".to_string(),
        "set -euo pipefail".to_string(),
        String::new(),
    ];
    for op in &sorted {
        if op.path.is_empty() {
            continue;
        }
        match op.op {
            PatchAction::Delete => {
                parts.push(format!("rm -f '{}'", op.path));
            }
            PatchAction::Add | PatchAction::Modify => {
                if let Some((dir, _)) = op.path.rsplit_once('/') {
                    parts.push(format!("mkdir -p '{dir}'"));
                }
                let b64 = BASE64.encode(op.text.as_bytes());
                parts.push(format!("echo '{b64}' | base64 -d > '{}'", op.path));
                parts.push(String::new());
            }
        }
    }
    let experiment_commands = experiment_plan
        .map(|p| p.commands.as_slice())
        .unwrap_or_default();
    let cmd = if !experiment_commands.is_empty() {
        experiment_commands.join(" ")
    } else if matches!(language, "python" | "py") {
        "python -m pytest".to_string()
    } else {
        "true".to_string()
    };
    if !experiment_commands.is_empty() {
        parts.push(format!("mkdir -p .synesis/experiments/{attempt_id}"));
        parts.push(format!(
            "export SYNESIS_EXPERIMENT_DIR=.synesis/experiments/{attempt_id}"
        ));
        parts.push(String::new());
    }
    parts.push(cmd);
    parts.join("\n")
}

/// Whether a patch set carries any writable content (a patch-ops-only
/// submission with nothing to write is treated as "no code").
#[must_use]
pub fn has_patch_content(ops: &[PatchOp]) -> bool {
    ops.iter()
        .any(|op| !op.text.is_empty() || op.op == PatchAction::Delete)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(path: &str, action: PatchAction, text: &str) -> PatchOp {
        PatchOp {
            path: path.into(),
            op: action,
            text: text.into(),
        }
    }

    #[test]
    fn classification_precedence() {
        let mut result = SandboxResult {
            exit_code: 1,
            ..Default::default()
        };
        result.lint.passed = false;
        result.security.passed = false;
        assert_eq!(classify_failure(&result, true), FailureKind::Lint);
        result.lint.passed = true;
        assert_eq!(classify_failure(&result, true), FailureKind::Security);
        result.security.passed = true;
        assert_eq!(classify_failure(&result, true), FailureKind::Lsp);
        assert_eq!(classify_failure(&result, false), FailureKind::Runtime);
    }

    #[test]
    fn canonical_order_is_by_path_then_op() {
        let ops = vec![
            op("b.py", PatchAction::Modify, "x"),
            op("a.py", PatchAction::Delete, ""),
            op("a.py", PatchAction::Add, "y"),
        ];
        let sorted = canonical_patch_order(ops);
        assert_eq!(sorted[0].path, "a.py");
        assert_eq!(sorted[0].op, PatchAction::Add);
        assert_eq!(sorted[1].op, PatchAction::Delete);
        assert_eq!(sorted[2].path, "b.py");
    }

    #[test]
    fn bundle_writes_files_then_runs_test_runner() {
        let script = bundle_patch_ops(
            &[op("src/hello.py", PatchAction::Add, "print('hi')\n")],
            "python",
            None,
            "run-0",
        );
        assert!(script.starts_with("#!/bin/bash\nset -euo pipefail"));
        assert!(script.contains("mkdir -p 'src'"));
        assert!(script.contains("| base64 -d > 'src/hello.py'"));
        assert!(script.ends_with("python -m pytest"));
    }

    #[test]
    fn bundle_prefers_experiment_commands() {
        let plan = ExperimentPlan {
            commands: vec!["pytest -q tests/".into()],
            ..Default::default()
        };
        let script = bundle_patch_ops(
            &[op("t.py", PatchAction::Add, "assert True\n")],
            "python",
            Some(&plan),
            "abc-1",
        );
        assert!(script.contains(".synesis/experiments/abc-1"));
        assert!(script.ends_with("pytest -q tests/"));
    }

    #[test]
    fn delete_ops_count_as_content() {
        assert!(has_patch_content(&[op("x", PatchAction::Delete, "")]));
        assert!(!has_patch_content(&[op("x", PatchAction::Modify, "")]));
    }
}
