//! Language-aware source scanning for the integrity gate.
//!
//! The gate must reject executable network access while accepting the same
//! literal text inside documentation: `import requests` as a statement
//! fails, the identical line inside a triple-quoted docstring passes. The
//! scanners here strip string and comment content per language before the
//! policy regexes run.

use regex::Regex;
use std::sync::OnceLock;

/// Language families the gate treats differently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LangFamily {
    Python,
    Shell,
    JsTs,
    Other,
}

/// Map a language name onto its scan family.
#[must_use]
pub fn family(language: &str) -> LangFamily {
    match language.to_lowercase().as_str() {
        "python" | "py" => LangFamily::Python,
        "bash" | "shell" | "sh" => LangFamily::Shell,
        "javascript" | "typescript" | "js" | "ts" => LangFamily::JsTs,
        _ => LangFamily::Other,
    }
}

/// Executable portions of Python source, line by line.
///
/// Triple-quoted strings (docstrings included) are blanked out, `#`
/// comments are stripped, and ordinary string literals are replaced with a
/// space, so whatever remains is code.
#[must_use]
pub fn python_code_lines(code: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut triple: Option<&'static str> = None;
    for (idx, raw) in code.lines().enumerate() {
        let mut out = String::with_capacity(raw.len());
        let bytes: Vec<char> = raw.chars().collect();
        let mut i = 0;
        while i < bytes.len() {
            if let Some(delim) = triple {
                // Inside a triple-quoted string: look for the terminator.
                if matches_at(&bytes, i, delim) {
                    triple = None;
                    i += 3;
                } else {
                    i += 1;
                }
                continue;
            }
            if matches_at(&bytes, i, "\"\"\"") {
                triple = Some("\"\"\"");
                i += 3;
                continue;
            }
            if matches_at(&bytes, i, "'''") {
                triple = Some("'''");
                i += 3;
                continue;
            }
            match bytes[i] {
                '#' => break,
                quote @ ('"' | '\'') => {
                    // Skip a single-line string literal.
                    i += 1;
                    while i < bytes.len() {
                        if bytes[i] == '\\' {
                            i += 2;
                            continue;
                        }
                        if bytes[i] == quote {
                            i += 1;
                            break;
                        }
                        i += 1;
                    }
                    out.push(' ');
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        if !out.trim().is_empty() {
            lines.push((idx + 1, out));
        }
    }
    lines
}

fn matches_at(chars: &[char], at: usize, needle: &str) -> bool {
    let needle: Vec<char> = needle.chars().collect();
    chars.len() >= at + needle.len() && chars[at..at + needle.len()] == needle[..]
}

/// Executable portions of shell/JS source: comments and quoted strings
/// stripped per line.
#[must_use]
pub fn stripped_code_lines(code: &str, fam: LangFamily) -> Vec<(usize, String)> {
    let comment_marker = match fam {
        LangFamily::Shell => "#",
        LangFamily::JsTs => "//",
        _ => "#",
    };
    code.lines()
        .enumerate()
        .filter_map(|(idx, raw)| {
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with(comment_marker) {
                return None;
            }
            if fam == LangFamily::JsTs && trimmed.starts_with('*') {
                return None;
            }
            let without_comment = match raw.find(comment_marker) {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let stripped = strip_quotes(without_comment);
            if stripped.trim().is_empty() {
                None
            } else {
                Some((idx + 1, stripped))
            }
        })
        .collect()
}

/// Replace single/double-quoted spans with a space.
fn strip_quotes(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            quote @ ('"' | '\'') => {
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\\' {
                        i += 2;
                        continue;
                    }
                    if chars[i] == quote {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                out.push(' ');
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Top-level modules imported by executable Python code, with line numbers.
#[must_use]
pub fn python_imports(code: &str) -> Vec<(usize, String)> {
    static IMPORT_RE: OnceLock<Regex> = OnceLock::new();
    static FROM_RE: OnceLock<Regex> = OnceLock::new();
    let import_re = IMPORT_RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*import\s+([A-Za-z_][\w.]*(?:\s*,\s*[A-Za-z_][\w.]*)*)")
            .expect("static pattern")
    });
    let from_re = FROM_RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*from\s+([A-Za-z_][\w.]*)\s+import\b").expect("static pattern")
    });

    let mut imports = Vec::new();
    for (line_no, line) in python_code_lines(code) {
        if let Some(cap) = import_re.captures(&line) {
            for name in cap[1].split(',') {
                let top = name.trim().split('.').next().unwrap_or_default();
                if !top.is_empty() {
                    imports.push((line_no, top.to_string()));
                }
            }
        }
        if let Some(cap) = from_re.captures(&line) {
            let top = cap[1].split('.').next().unwrap_or_default();
            if !top.is_empty() {
                imports.push((line_no, top.to_string()));
            }
        }
    }
    imports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docstring_content_is_not_code() {
        let code = "def f():\n    \"\"\"\n    import requests\n    \"\"\"\n    return 1\n";
        let lines = python_code_lines(code);
        assert!(lines.iter().all(|(_, l)| !l.contains("import requests")));
    }

    #[test]
    fn executable_import_survives_stripping() {
        let code = "import requests\nprint('ok')\n";
        let imports = python_imports(code);
        assert_eq!(imports, vec![(1, "requests".to_string())]);
    }

    #[test]
    fn comment_and_string_imports_are_ignored() {
        let code = "# import requests\nx = 'import requests'\n";
        assert!(python_imports(code).is_empty());
    }

    #[test]
    fn comma_imports_split() {
        let code = "import os, socket\n";
        let tops: Vec<String> = python_imports(code).into_iter().map(|(_, m)| m).collect();
        assert_eq!(tops, vec!["os".to_string(), "socket".to_string()]);
    }

    #[test]
    fn shell_strings_and_comments_are_stripped() {
        let code = "echo 'curl http://x'  # curl comment\ncurl http://evil\n";
        let lines = stripped_code_lines(code, LangFamily::Shell);
        assert_eq!(lines.len(), 2);
        assert!(!lines[0].1.contains("curl"));
        assert!(lines[1].1.contains("curl"));
    }

    #[test]
    fn js_line_comments_are_dropped() {
        let code = "// fetch('x')\nconst a = fetch(url);\n";
        let lines = stripped_code_lines(code, LangFamily::JsTs);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].1.contains("fetch"));
    }
}
