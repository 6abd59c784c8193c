//! Validation of model-produced stage outputs.
//!
//! Model text is untrusted input: it arrives wrapped in markdown fences,
//! prefixed with prose, or truncated mid-object. [`extract_json`] finds the
//! embedded object with a depth scanner that is string-aware, and applies
//! one automatic repair pass (append closing braces, strip trailing
//! commas) before giving up. A second failure is a hard validation error:
//! the stage degrades to a respond with explanation rather than retrying
//! forever.

use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{ExperimentPlan, PatchOp, PlanStep};

/// Errors from parsing stage output.
#[derive(Debug, Error, Diagnostic)]
pub enum SchemaError {
    /// No JSON object found in the model output at all.
    #[error("no JSON object found in model output")]
    #[diagnostic(code(synesis::schemas::no_object))]
    NoObject,

    /// The object was found but did not parse, even after repair.
    #[error("model output failed to parse after repair: {0}")]
    #[diagnostic(
        code(synesis::schemas::unparseable),
        help("The stage should degrade to a respond with explanation.")
    )]
    Unparseable(String),

    /// Parsed JSON did not match the expected schema.
    #[error("model output did not match the schema: {0}")]
    #[diagnostic(code(synesis::schemas::mismatch))]
    Mismatch(String),
}

/// Extract the first JSON object embedded in raw model output.
///
/// Tries a direct parse, then a depth-based scan that ignores braces
/// inside string literals, then the repair pass: trailing-comma removal
/// and up to five appended closing braces for truncated output.
pub fn extract_json(raw: &str) -> Result<String, SchemaError> {
    let content = raw.trim();
    if serde_json::from_str::<serde_json::Value>(content).is_ok() {
        return Ok(content.to_string());
    }

    let start = content.find('{').ok_or(SchemaError::NoObject)?;
    let chars: Vec<char> = content.chars().collect();
    let char_start = content[..start].chars().count();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    let mut quote = '"';
    let mut end: Option<usize> = None;
    for (i, &c) in chars.iter().enumerate().skip(char_start) {
        if escape {
            escape = false;
            continue;
        }
        if in_string {
            if c == '\\' {
                escape = true;
            } else if c == quote {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                in_string = true;
                quote = c;
            }
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    if let Some(end) = end {
        let candidate: String = chars[char_start..=end].iter().collect();
        if serde_json::from_str::<serde_json::Value>(&candidate).is_ok() {
            return Ok(candidate);
        }
        if let Some(repaired) = repair(&candidate) {
            return Ok(repaired);
        }
    }

    // Truncated output: take first '{' to last '}' and repair.
    if let Some(last) = content.rfind('}') {
        if last > start {
            let candidate = &content[start..=last];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Ok(candidate.to_string());
            }
            if let Some(repaired) = repair(candidate) {
                return Ok(repaired);
            }
        }
    }
    // Ran off the end with the object still open.
    let tail: String = chars[char_start..].iter().collect();
    repair(&tail).ok_or_else(|| SchemaError::Unparseable("unbalanced braces".into()))
}

/// The single automatic repair pass: strip trailing commas, then append
/// closing braces (bounded).
fn repair(candidate: &str) -> Option<String> {
    let stripped = strip_trailing_commas(candidate);
    if serde_json::from_str::<serde_json::Value>(&stripped).is_ok() {
        return Some(stripped);
    }
    let mut attempt = stripped;
    for _ in 0..5 {
        attempt.push('}');
        if serde_json::from_str::<serde_json::Value>(&attempt).is_ok() {
            return Some(attempt);
        }
    }
    None
}

fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut in_string = false;
    let mut escape = false;
    for (i, &c) in chars.iter().enumerate() {
        if escape {
            escape = false;
            out.push(c);
            continue;
        }
        if in_string {
            if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }
        if c == ',' {
            // Drop the comma when the next non-whitespace closes a scope.
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Extract and deserialize into `T`.
pub fn parse_validated<T: DeserializeOwned>(raw: &str) -> Result<T, SchemaError> {
    let json = extract_json(raw)?;
    serde_json::from_str(&json).map_err(|e| SchemaError::Mismatch(e.to_string()))
}

// ── Stage output schemas ───────────────────────────────────────────────

fn default_confidence() -> f64 {
    0.5
}

/// Validated output from the supervisor stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SupervisorOut {
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub target_language: String,
    #[serde(default = "default_true")]
    pub needs_code_generation: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Asking beats guessing.
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_question: Option<String>,
    #[serde(default)]
    pub clarification_options: Vec<String>,
    /// Planning checkpoint for complex tasks.
    #[serde(default)]
    pub planning_suggested: bool,
    /// `worker`, `planner`, or `respond`.
    #[serde(default)]
    pub route_to: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Validated output from the planner stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlannerOut {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// The capability manifest the gate enforces on the worker.
    #[serde(default)]
    pub touched_files: Vec<String>,
}

/// Validated output from the worker stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerOut {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub edge_cases_considered: Vec<String>,
    /// Proactive "I need more" instead of guessing.
    #[serde(default)]
    pub needs_input: bool,
    #[serde(default)]
    pub needs_input_question: Option<String>,
    /// blocked_external | cannot_reproduce | unsafe_request |
    /// needs_scope_expansion
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub unified_diff: Option<String>,
    #[serde(default)]
    pub patch_ops: Vec<PatchOp>,
    #[serde(default)]
    pub experiment_plan: Option<ExperimentPlan>,
    /// Declared regressions: the only legitimate way to break a preserved
    /// stage.
    #[serde(default)]
    pub regressions_intended: Vec<String>,
    #[serde(default)]
    pub regression_justification: Option<String>,
}

/// Validated output from the critic stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CriticOut {
    #[serde(default)]
    pub what_if_analyses: Vec<crate::state::WhatIf>,
    #[serde(default)]
    pub overall_assessment: String,
    #[serde(default = "default_true")]
    pub approved: bool,
    #[serde(default)]
    pub revision_feedback: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    #[serde(default)]
    pub residual_risks: Vec<String>,
    /// Weak brittleness signal emitted in postmortem mode; advisory only.
    #[serde(default)]
    pub dark_debt_signal: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_parses_directly() {
        let out: WorkerOut = parse_validated(r#"{"code": "print(1)"}"#).unwrap();
        assert_eq!(out.code, "print(1)");
    }

    #[test]
    fn fenced_json_is_extracted() {
        let raw = "Here you go:\n```json\n{\"approved\": false, \"revision_feedback\": \"x\"}\n```";
        let out: CriticOut = parse_validated(raw).unwrap();
        assert!(!out.approved);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let raw = r#"{"code": "d = {'a': 1}", "explanation": "a dict"}"#;
        let out: WorkerOut = parse_validated(raw).unwrap();
        assert!(out.code.contains('{'));
    }

    #[test]
    fn truncated_output_is_repaired_once() {
        let raw = r#"{"task_description": "x", "needs_clarification": true"#;
        let out: SupervisorOut = parse_validated(raw).unwrap();
        assert!(out.needs_clarification);
    }

    #[test]
    fn trailing_commas_are_stripped() {
        let raw = r#"{"steps": [], "touched_files": ["a.py",],}"#;
        let out: PlannerOut = parse_validated(raw).unwrap();
        assert_eq!(out.touched_files, vec!["a.py"]);
    }

    #[test]
    fn no_object_is_a_hard_error() {
        let err = extract_json("I cannot answer that.").unwrap_err();
        assert!(matches!(err, SchemaError::NoObject));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let out: WorkerOut = parse_validated("{}").unwrap();
        assert!((out.confidence - 0.5).abs() < f64::EPSILON);
        assert!(out.patch_ops.is_empty());
        assert!(out.stop_reason.is_none());
    }
}
