//! Individual gate checks. Each returns `Ok(())` or the first
//! [`IntegrityFailure`] it finds; `run_gate` owns the ordering.

use regex::Regex;
use std::sync::OnceLock;

use super::lang::{family, python_code_lines, python_imports, stripped_code_lines, LangFamily};
use super::{GateCategory, IntegrityFailure};
use crate::state::PatchOp;
use crate::strategy::StrategyConstraints;

fn paths_of<'a>(
    files_touched: &'a [String],
    patch_ops: &'a [PatchOp],
) -> impl Iterator<Item = &'a str> {
    files_touched
        .iter()
        .map(String::as_str)
        .filter(|p| !p.trim().is_empty() && !p.trim_start().starts_with('#'))
        .chain(
            patch_ops
                .iter()
                .map(|op| op.path.as_str())
                .filter(|p| !p.trim().is_empty()),
        )
}

/// Check 1: every path must live under the session workspace. Divergence
/// requires a Re-Plan, not a silent rewrite.
pub fn check_workspace_boundary(
    files_touched: &[String],
    patch_ops: &[PatchOp],
    target_workspace: &str,
) -> Result<(), IntegrityFailure> {
    let prefix = target_workspace.trim_end_matches('/');
    if prefix.is_empty() {
        return Ok(());
    }
    for path in paths_of(files_touched, patch_ops) {
        let norm = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        if norm != prefix && !norm.starts_with(&format!("{prefix}/")) {
            return Err(IntegrityFailure::new(
                GateCategory::Workspace,
                format!("Path {path} is outside target_workspace {target_workspace}"),
                "All paths must be under the workspace root. Request a Re-Plan from the \
                 Supervisor to adjust scope.",
            ));
        }
    }
    Ok(())
}

/// Check 2: capability-based allowlist. The worker may only touch files in
/// the planner's `touched_files` manifest (exact match or subdirectory).
pub fn check_scope(
    files_touched: &[String],
    patch_ops: &[PatchOp],
    touched_files: &[String],
    target_workspace: &str,
) -> Result<(), IntegrityFailure> {
    if touched_files.is_empty() {
        return Ok(());
    }
    let allowed: Vec<String> = touched_files
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.trim_end_matches('/').to_string())
        .collect();
    let ws_prefix = target_workspace.trim_end_matches('/');
    for path in paths_of(files_touched, patch_ops) {
        let norm = if path.starts_with('/') {
            path.to_string()
        } else if !ws_prefix.is_empty() {
            format!("{ws_prefix}/{path}")
        } else {
            path.to_string()
        };
        let matched = allowed.iter().any(|a| {
            let a_norm = if a.starts_with('/') || ws_prefix.is_empty() {
                a.clone()
            } else {
                format!("{ws_prefix}/{a}")
            };
            norm == a_norm || norm.starts_with(&format!("{a_norm}/"))
        });
        if !matched {
            return Err(IntegrityFailure::new(
                GateCategory::Scope,
                format!("Path {path} is not in the plan's touched_files manifest"),
                "Scope violation: you may only modify files listed in the execution plan. \
                 Request a Re-Plan from the Supervisor to expand the allowlist.",
            ));
        }
    }
    Ok(())
}

/// Check 3: patch ops must be well-formed: no traversal, no doubled
/// separators, no symlink creation smuggled into content.
pub fn check_patch_op_constraints(patch_ops: &[PatchOp]) -> Result<(), IntegrityFailure> {
    for op in patch_ops {
        if op.path.contains("..") || op.path.contains("//") {
            return Err(IntegrityFailure::new(
                GateCategory::Path,
                format!("Path traversal: {}", op.path),
                "Use relative paths under the workspace. No '../' or '//'.",
            ));
        }
        if op.text.contains("ln -s") {
            return Err(IntegrityFailure::new(
                GateCategory::Path,
                format!("Symlink creation (ln -s) in patch content for {}", op.path),
                "Symlink creation is forbidden. Use regular files only.",
            ));
        }
    }
    Ok(())
}

/// Check 4: per-file patch size.
pub fn check_patch_file_size(
    patch_ops: &[PatchOp],
    max_chars: usize,
) -> Result<(), IntegrityFailure> {
    for op in patch_ops {
        if op.text.chars().count() > max_chars {
            return Err(IntegrityFailure::new(
                GateCategory::Size,
                format!(
                    "File {} exceeds {max_chars} chars ({})",
                    op.path,
                    op.text.chars().count()
                ),
                format!("Reduce patch content to under {max_chars} characters per file."),
            ));
        }
    }
    Ok(())
}

fn loc_delta_from_diff(unified_diff: &str) -> i64 {
    let mut delta = 0i64;
    for line in unified_diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            delta += 1;
        } else if line.starts_with('-') {
            delta -= 1;
        }
    }
    delta.abs()
}

fn loc_delta_from_ops(patch_ops: &[PatchOp]) -> i64 {
    patch_ops
        .iter()
        .map(|op| op.text.lines().count() as i64)
        .sum()
}

/// Check 5: diff shape against the active strategy: file count and LOC
/// delta.
pub fn check_diff_shape(
    files_touched: &[String],
    patch_ops: &[PatchOp],
    unified_diff: Option<&str>,
    constraints: &StrategyConstraints,
) -> Result<(), IntegrityFailure> {
    let mut files: Vec<&str> = paths_of(files_touched, patch_ops).collect();
    files.sort_unstable();
    files.dedup();
    if files.len() > constraints.max_files_touched {
        return Err(IntegrityFailure::new(
            GateCategory::Size,
            format!(
                "{} files touched; the active strategy allows {}",
                files.len(),
                constraints.max_files_touched
            ),
            "Reduce scope. Stay within the revision strategy's max_files_touched.",
        ));
    }
    let delta =
        loc_delta_from_diff(unified_diff.unwrap_or_default()) + loc_delta_from_ops(patch_ops);
    if delta > constraints.max_loc_delta as i64 {
        return Err(IntegrityFailure::new(
            GateCategory::Size,
            format!(
                "LOC delta {delta} exceeds max {}",
                constraints.max_loc_delta
            ),
            "Reduce scope. Stay within the revision strategy's max_loc_delta.",
        ));
    }
    Ok(())
}

/// Check 6: no declared path may be a denylisted file (lockfiles).
pub fn check_denylisted_paths(
    files_touched: &[String],
    patch_ops: &[PatchOp],
    denylist: &[String],
) -> Result<(), IntegrityFailure> {
    for path in paths_of(files_touched, patch_ops) {
        for name in denylist {
            if path.contains(name.as_str()) {
                return Err(IntegrityFailure::new(
                    GateCategory::Path,
                    format!("File {path}"),
                    "Remove it from files_touched/patch_ops. Lockfiles are denylisted.",
                ));
            }
        }
    }
    Ok(())
}

fn write_indicator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:^|\s)(?:>|>>|cp\s|mv\s|sed\s+[^;]*-i)").expect("static pattern")
    })
}

/// Lockfile writes hidden in script bodies: a write indicator combined
/// with a denylisted filename on the same line.
pub fn check_denylisted_writes(code: &str, denylist: &[String]) -> Result<(), IntegrityFailure> {
    for (idx, line) in code.lines().enumerate() {
        if !write_indicator_re().is_match(line) {
            continue;
        }
        for name in denylist {
            if line.contains(name.as_str()) {
                let excerpt: String = line.trim().chars().take(60).collect();
                return Err(IntegrityFailure::new(
                    GateCategory::Path,
                    format!("Line ~{}: {excerpt}", idx + 1),
                    "Remove edits to lockfiles (package-lock.json, yarn.lock, etc.).",
                ));
            }
        }
    }
    Ok(())
}

/// Check 7a: experiment command count.
pub fn check_experiment_blast_radius(
    commands: &[String],
    max_commands: usize,
) -> Result<(), IntegrityFailure> {
    if commands.len() > max_commands {
        return Err(IntegrityFailure::new(
            GateCategory::Dangerous,
            format!(
                "Experiment has {} commands; max {max_commands}",
                commands.len()
            ),
            format!("Reduce experiment_plan.commands to at most {max_commands} commands."),
        ));
    }
    Ok(())
}

const HIGH_RISK_COMMANDS: [&str; 6] = [
    "pip install",
    "pip3 install",
    "npm install",
    "yarn add",
    "go get",
    "cargo add",
];

/// Check 7b: package installation inside experiments. Network egress is
/// already denied at the runtime layer; this keeps the intent out of the
/// plan too.
pub fn check_experiment_high_risk(commands: &[String]) -> Result<(), IntegrityFailure> {
    for cmd in commands {
        let lower = cmd.to_lowercase();
        for risky in HIGH_RISK_COMMANDS {
            if lower.contains(risky) {
                let excerpt: String = cmd.chars().take(80).collect();
                return Err(IntegrityFailure::new(
                    GateCategory::Dangerous,
                    format!("High-risk command in experiment: {excerpt}"),
                    "Experiments may not run pip install, npm install, go get, etc. Use \
                     pre-installed dependencies.",
                ));
            }
        }
    }
    Ok(())
}

/// Check 7c: every experiment command's interpreter must be allowlisted.
pub fn check_experiment_allowlist(
    commands: &[String],
    allowlist: &[String],
) -> Result<(), IntegrityFailure> {
    let allowed: Vec<String> = allowlist.iter().map(|c| c.trim().to_lowercase()).collect();
    for cmd in commands {
        let first = cmd
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();
        if first.is_empty() || first.starts_with('#') {
            continue;
        }
        if !allowed.iter().any(|a| first == *a || first.starts_with(a)) {
            let excerpt: String = cmd.chars().take(60).collect();
            return Err(IntegrityFailure::new(
                GateCategory::Path,
                format!("Command: {excerpt}"),
                "Evidence experiment commands must use allowlisted interpreters (python, \
                 pytest, bash, ...).",
            ));
        }
    }
    Ok(())
}

/// Check 8: combined artifact size.
pub fn check_max_size(code: &str, max_chars: usize) -> Result<(), IntegrityFailure> {
    let len = code.chars().count();
    if len > max_chars {
        return Err(IntegrityFailure::new(
            GateCategory::Size,
            format!("Code length {len} exceeds limit {max_chars}"),
            "Produce a shorter script or split the work into smaller units.",
        ));
    }
    Ok(())
}

/// Check 9: the artifact must be clean text. NUL bytes or replacement
/// characters mark binary content that did not survive UTF-8.
pub fn check_text_sanity(code: &str) -> Result<(), IntegrityFailure> {
    if code.contains('\u{0}') || code.contains('\u{FFFD}') {
        return Err(IntegrityFailure::new(
            GateCategory::Binary,
            "Invalid UTF-8 or binary content",
            "Produce valid UTF-8 text only. No binary edits.",
        ));
    }
    Ok(())
}

fn secret_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"(?i)(?:api[_-]?key|secret|password|token)\s*=\s*['"]?[A-Za-z0-9_\-]{8,}['"]?"#,
            r"-----BEGIN\s+(?:RSA\s+)?PRIVATE\s+KEY-----",
            r"-----BEGIN\s+[A-Z]+\s+PRIVATE\s+KEY-----",
        ]
        .into_iter()
        .filter_map(|src| Regex::new(src).ok())
        .collect()
    })
}

/// Check 10: hardcoded credentials.
pub fn check_secrets(code: &str) -> Result<(), IntegrityFailure> {
    for pattern in secret_patterns() {
        if let Some(m) = pattern.find(code) {
            let line = code[..m.start()].matches('\n').count() + 1;
            let excerpt: String = m.as_str().chars().take(80).collect();
            return Err(IntegrityFailure::new(
                GateCategory::Secret,
                format!("Line ~{line}: {excerpt}"),
                "Remove the hardcoded API key/secret and use environment variables.",
            ));
        }
    }
    Ok(())
}

const PYTHON_NETWORK_MODULES: [&str; 6] =
    ["requests", "urllib", "urllib3", "socket", "httpx", "http"];

fn python_network_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?:requests\.(?:get|post|put|delete|request|head|patch)|urllib\.request|urllib3\.request|socket\.(?:connect|create_connection)|httpx\.(?:get|post|AsyncClient|Client)|http\.client\.(?:HTTPConnection|HTTPSConnection))\s*\(",
        )
        .expect("static pattern")
    })
}

fn shell_network_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:\b(?:curl|wget|netcat)\b|\bnc\s|/dev/tcp/)").expect("static pattern")
    })
}

fn js_network_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:\bfetch\s*\(|axios\.(?:get|post|create)\s*\(|require\s*\(\s*['"]https?://)"#)
            .expect("static pattern")
    })
}

/// Check 11: network access. Python gets the string-aware scan; shell and
/// JS strip literals and comments before the pattern pass.
pub fn check_network(code: &str, language: &str) -> Result<(), IntegrityFailure> {
    match family(language) {
        LangFamily::Python => {
            for (line_no, module) in python_imports(code) {
                let top = module.as_str();
                if PYTHON_NETWORK_MODULES.contains(&top) {
                    return Err(network_failure(line_no, &format!("import {module}")));
                }
            }
            for (line_no, line) in python_code_lines(code) {
                if let Some(m) = python_network_call_re().find(&line) {
                    return Err(network_failure(line_no, m.as_str()));
                }
            }
        }
        LangFamily::Shell => {
            for (line_no, line) in stripped_code_lines(code, LangFamily::Shell) {
                if let Some(m) = shell_network_re().find(&line) {
                    return Err(network_failure(line_no, m.as_str().trim()));
                }
            }
        }
        LangFamily::JsTs => {
            for (line_no, line) in stripped_code_lines(code, LangFamily::JsTs) {
                if let Some(m) = js_network_re().find(&line) {
                    return Err(network_failure(line_no, m.as_str().trim()));
                }
            }
        }
        LangFamily::Other => {}
    }
    Ok(())
}

fn network_failure(line: usize, symbol: &str) -> IntegrityFailure {
    let symbol_head: String = symbol.chars().take(40).collect();
    IntegrityFailure::new(
        GateCategory::Network,
        format!("Line ~{line}: {symbol}"),
        format!(
            "You attempted to use '{symbol_head}'. The sandbox has no network; use the internal \
             MockClient or declare an external tool requirement."
        ),
    )
}

fn dangerous_shell_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\brm\s+-rf\s+",
            r"(?i)\brm\s+--recursive\s+",
            r"(?i)curl\s+[^|]*\|\s*bash",
            r"(?i)wget\s+[^|]*\|\s*(?:bash|sh)\b",
            r":\s*\(\s*\)\s*\{\s*:\s*\|",
        ]
        .into_iter()
        .filter_map(|src| Regex::new(src).ok())
        .collect()
    })
}

/// Check 12: destructive shell commands (`rm -rf`, `curl|bash`, fork
/// bombs). Shell-family artifacts only.
pub fn check_dangerous_commands(code: &str, language: &str) -> Result<(), IntegrityFailure> {
    if family(language) != LangFamily::Shell {
        return Ok(());
    }
    for (line_no, line) in stripped_code_lines(code, LangFamily::Shell) {
        for pattern in dangerous_shell_patterns() {
            if let Some(m) = pattern.find(&line) {
                let excerpt: String = m.as_str().chars().take(60).collect();
                return Err(IntegrityFailure::new(
                    GateCategory::Dangerous,
                    format!("Line ~{line_no}: {excerpt}"),
                    "Remove rm -rf, curl|bash, or fork bombs. Use safer alternatives.",
                ));
            }
        }
    }
    Ok(())
}

/// Check 13: every imported top-level Python module must be in the
/// trusted-packages list. Guards against typosquatting. An empty list
/// disables the check.
pub fn check_import_integrity(
    code: &str,
    language: &str,
    trusted_packages: &[String],
) -> Result<(), IntegrityFailure> {
    if family(language) != LangFamily::Python || trusted_packages.is_empty() {
        return Ok(());
    }
    let trusted: Vec<String> = trusted_packages
        .iter()
        .map(|p| p.trim().to_lowercase())
        .collect();
    for (line_no, module) in python_imports(code) {
        if !trusted.contains(&module.to_lowercase()) {
            return Err(IntegrityFailure::new(
                GateCategory::Import,
                format!("Line ~{line_no}: import {module}"),
                format!(
                    "Package '{module}' is not in the trusted-packages list. Use an allowed \
                     package or declare an external tool requirement."
                ),
            ));
        }
    }
    Ok(())
}
