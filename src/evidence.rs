//! Evidence records: reproducible, citable references to tool invocations.
//!
//! Every external tool call (retrieval, analysis, sandbox) produces a
//! [`ToolRef`] carrying hashes of its parameters and result. Parameter
//! hashes are salted with the tool version so a tool upgrade invalidates
//! prior evidence instead of silently matching it. Sandbox results
//! additionally carry a [failure fingerprint](result_fingerprint) used for
//! same-failure detection: different commands that normalize to the same
//! failure are treated as repeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::sandbox::SandboxResult;

/// Compact, URL-safe content hash (first 32 hex chars of SHA-256).
#[must_use]
pub fn compact_hash(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Which tool produced a piece of evidence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Rag,
    Lsp,
    Sandbox,
}

impl ToolKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Rag => "rag",
            ToolKind::Lsp => "lsp",
            ToolKind::Sandbox => "sandbox",
        }
    }
}

/// Evidence from one tool invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolRef {
    pub tool: ToolKind,
    /// Propagated as `X-Synesis-Request-ID` for log correlation.
    pub request_id: String,
    /// Canonical parameter hash; mismatch means "re-run to reproduce".
    pub parameters_hash: String,
    pub result_hash: String,
    /// One-line deterministic outcome, e.g. `Exit: 1 · Lint: Pass · Sec: Pass`.
    pub result_summary: String,
    /// Normalized failure identity for sandbox results; empty otherwise.
    pub result_fingerprint: String,
    /// Hashes of per-section artifacts (lint/security/execution blobs).
    pub artifact_hashes: Vec<String>,
    pub tool_version: String,
    pub created_at: DateTime<Utc>,
}

/// Canonicalize per-tool parameter ingredients and hash them, salted with
/// the tool version.
#[must_use]
pub fn tool_params_hash(tool: ToolKind, params: &Value, tool_version: &str) -> String {
    let keys: &[&str] = match tool {
        ToolKind::Sandbox => &["code", "language", "context_files"],
        ToolKind::Lsp => &["code", "language", "filename"],
        ToolKind::Rag => &["query", "top_k", "reranker", "collections", "strategy"],
    };
    let mut canon = serde_json::Map::new();
    if let Some(obj) = params.as_object() {
        for key in keys {
            if let Some(v) = obj.get(*key) {
                canon.insert((*key).to_string(), v.clone());
            }
        }
    }
    if !tool_version.is_empty() {
        canon.insert("_tool_version".into(), json!(tool_version));
    }
    // serde_json maps are sorted by key, so serialization is canonical.
    compact_hash(&Value::Object(canon).to_string())
}

/// One-line deterministic sandbox status: Exit · Lint · Sec.
#[must_use]
pub fn sandbox_result_summary(result: &SandboxResult) -> String {
    let lint = if result.lint.passed { "Pass" } else { "Fail" };
    let lint_detail = if result.lint.diagnostics.is_empty() {
        String::new()
    } else {
        format!(" ({})", result.lint.diagnostics.len())
    };
    let sec = if result.security.passed {
        "Pass"
    } else {
        "Fail"
    };
    format!(
        "Exit: {} · Lint: {lint}{lint_detail} · Sec: {sec}",
        result.exit_code
    )
}

/// Deterministic normalized failure identity:
/// `{stage}:{exit_code}:{first_diagnostic_id_or_exception_class}`.
///
/// The exception class is taken from the first line of the first 200 chars
/// of the runtime output, up to the first `:`.
#[must_use]
pub fn result_fingerprint(result: &SandboxResult) -> String {
    if !result.lint.passed {
        let detail = result
            .lint
            .diagnostics
            .first()
            .map(|d| truncate(&d.rule, 32))
            .unwrap_or_default();
        return format!("lint:{}:{}", result.exit_code, detail);
    }
    if !result.security.passed {
        let detail = result
            .security
            .findings
            .first()
            .map(|f| truncate(&f.rule, 32))
            .unwrap_or_default();
        return format!("security:{}:{}", result.exit_code, detail);
    }
    let err: String = result.execution.output.chars().take(200).collect();
    let first_line = err.lines().next().unwrap_or("");
    let class = match first_line.split_once(':') {
        Some((head, _)) => head.to_string(),
        None => truncate(first_line, 40),
    };
    format!("runtime:{}:{}", result.exit_code, class)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Build a [`ToolRef`] for a completed tool invocation.
pub fn make_tool_ref(
    tool: ToolKind,
    params: &Value,
    result: &Value,
    request_id: Option<String>,
    result_summary: impl Into<String>,
    tool_version: &str,
) -> ToolRef {
    let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let result_hash = compact_hash(&result.to_string());
    let mut artifact_hashes = Vec::new();
    if tool == ToolKind::Sandbox {
        if let Some(obj) = result.as_object() {
            for key in ["lint", "security", "execution"] {
                if let Some(section) = obj.get(key) {
                    if !section.is_null() {
                        artifact_hashes.push(compact_hash(&section.to_string()));
                    }
                }
            }
        }
    }
    let fingerprint = if tool == ToolKind::Sandbox {
        serde_json::from_value::<SandboxResult>(result.clone())
            .map(|r| result_fingerprint(&r))
            .unwrap_or_default()
    } else {
        String::new()
    };
    ToolRef {
        tool,
        request_id,
        parameters_hash: tool_params_hash(tool, params, tool_version),
        result_hash,
        result_summary: result_summary.into(),
        result_fingerprint: fingerprint,
        artifact_hashes,
        tool_version: tool_version.to_string(),
        created_at: Utc::now(),
    }
}

/// Patch provenance: ties sandbox logs to the exact artifact version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRef {
    pub content_hash: String,
    pub files: Vec<FileRef>,
    pub patch_hash: String,
}

/// Per-file provenance entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    pub hash: String,
}

/// Build a [`CodeRef`] from the worker's output.
#[must_use]
pub fn make_code_ref(
    generated_code: &str,
    files_touched: &[String],
    patch_ops: &[crate::state::PatchOp],
    unified_diff: Option<&str>,
) -> CodeRef {
    let content_hash = if generated_code.is_empty() {
        String::new()
    } else {
        compact_hash(generated_code)
    };
    let files = files_touched
        .iter()
        .take(20)
        .map(|path| {
            let text = patch_ops
                .iter()
                .find(|op| &op.path == path)
                .map(|op| op.text.as_str())
                .filter(|t| !t.is_empty())
                .unwrap_or(path.as_str());
            FileRef {
                path: path.clone(),
                hash: compact_hash(text),
            }
        })
        .collect();
    let patch_blob = if patch_ops.is_empty() {
        unified_diff.unwrap_or_default().to_string()
    } else {
        let tuples: Vec<Value> = patch_ops
            .iter()
            .map(|op| json!([op.path, op.op.as_str(), op.text]))
            .collect();
        Value::Array(tuples).to_string()
    };
    let patch_hash = if patch_blob.is_empty() {
        String::new()
    } else {
        compact_hash(&patch_blob)
    };
    CodeRef {
        content_hash,
        files,
        patch_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ExecutionSection, LintSection, SecuritySection};

    fn runtime_failure(output: &str, exit_code: i32) -> SandboxResult {
        SandboxResult {
            exit_code,
            lint: LintSection {
                passed: true,
                ..Default::default()
            },
            security: SecuritySection {
                passed: true,
                ..Default::default()
            },
            execution: ExecutionSection {
                exit_code,
                output: output.into(),
            },
            error: None,
        }
    }

    #[test]
    fn runtime_fingerprint_uses_exception_class() {
        let result = runtime_failure("NameError: name 'x' is not defined", 1);
        assert_eq!(result_fingerprint(&result), "runtime:1:NameError");
    }

    #[test]
    fn fingerprint_is_stable_across_differing_tails() {
        let a = runtime_failure("NameError: name 'x' is not defined", 1);
        let b = runtime_failure("NameError: name 'other' is not defined", 1);
        assert_eq!(result_fingerprint(&a), result_fingerprint(&b));
    }

    #[test]
    fn lint_fingerprint_uses_first_rule() {
        let mut result = runtime_failure("", 1);
        result.lint.passed = false;
        result.lint.diagnostics.push(crate::sandbox::Diagnostic {
            rule: "E501".into(),
            message: "line too long".into(),
            ..Default::default()
        });
        assert_eq!(result_fingerprint(&result), "lint:1:E501");
    }

    #[test]
    fn params_hash_changes_with_tool_version() {
        let params = json!({"code": "print(1)", "language": "python"});
        let a = tool_params_hash(ToolKind::Sandbox, &params, "v1");
        let b = tool_params_hash(ToolKind::Sandbox, &params, "v2");
        assert_ne!(a, b);
    }

    #[test]
    fn params_hash_ignores_unrelated_keys() {
        let a = json!({"code": "x", "language": "python", "noise": 1});
        let b = json!({"code": "x", "language": "python", "noise": 2});
        assert_eq!(
            tool_params_hash(ToolKind::Sandbox, &a, ""),
            tool_params_hash(ToolKind::Sandbox, &b, ""),
        );
    }

    #[test]
    fn code_ref_hashes_patch_ops_canonically() {
        let ops = vec![crate::state::PatchOp {
            path: "src/foo.py".into(),
            op: crate::state::PatchAction::Modify,
            text: "x = 1\n".into(),
        }];
        let code_ref = make_code_ref("", &["src/foo.py".into()], &ops, None);
        assert!(code_ref.content_hash.is_empty());
        assert_eq!(code_ref.files.len(), 1);
        assert!(!code_ref.patch_hash.is_empty());
    }
}
