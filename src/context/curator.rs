//! Deterministic context-pack assembly.
//!
//! The builder is a pure function over its inputs: identical inputs
//! produce identical packs (and identical `context_hash`es), which is what
//! makes a worker invocation reproducible. All I/O (fetching org
//! standards, re-querying retrieval on a pivot) happens in the curator
//! stage before the builder runs.
//!
//! Tiering:
//! - Tier 1: hardcoded global invariants (output format, sandbox contract)
//! - Tier 2: organization standards
//! - Tier 3: project manifest
//! - Tier 4: session (task description + plan steps)
//!
//! All four land in `pinned` as trusted; retrieval results land in
//! `retrieved` as untrusted.

use std::collections::BTreeSet;

use regex::Regex;
use std::sync::OnceLock;

use super::pack::{
    ConflictSeverity, ConflictWarning, ContextChunk, ContextConflict, ContextPack, ExcludedChunk,
    ExclusionReason, Origin, OriginMetadata, SanitizationAction,
};
use super::sanitize::{sanitize_chunk, InjectionAction};
use crate::evidence::compact_hash;
use crate::state::{ExecutionPlan, RetrievedChunk};

/// Curation tunables, resolved from settings by the stage.
#[derive(Clone, Debug)]
pub struct CuratorConfig {
    pub top_k: usize,
    /// 0 disables the character budget.
    pub retrieval_budget_chars: usize,
    pub drift_jaccard_threshold: f64,
    pub budget_alert_threshold: f64,
    pub injection_scan_enabled: bool,
    pub injection_action: InjectionAction,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            retrieval_budget_chars: 24_000,
            drift_jaccard_threshold: 0.2,
            budget_alert_threshold: 0.85,
            injection_scan_enabled: true,
            injection_action: InjectionAction::Reduce,
        }
    }
}

/// Everything the builder needs, gathered by the stage.
#[derive(Clone, Debug, Default)]
pub struct PackInputs {
    pub task_description: String,
    pub target_language: String,
    pub plan: Option<ExecutionPlan>,
    pub iteration: u32,
    pub user_id: String,
    /// Tier 2 texts as `(doc_id, collection, text)`.
    pub org_standards: Vec<(String, String, String)>,
    /// Tier 3 texts as `(doc_id, text)`.
    pub project_manifest: Vec<(String, String)>,
    /// Ranked retrieval results, best first (pivot merge already applied).
    pub retrieval: Vec<RetrievedChunk>,
    pub prev_pack: Option<ContextPack>,
}

/// Build the pack. Pure and deterministic.
#[must_use]
pub fn build_pack(inputs: &PackInputs, config: &CuratorConfig) -> ContextPack {
    let org_chunks: Vec<ContextChunk> = inputs
        .org_standards
        .iter()
        .map(|(doc_id, collection, text)| ContextChunk {
            source: "arch".into(),
            text: text.clone(),
            score: 0.9,
            collection: collection.clone(),
            doc_id: doc_id.clone(),
            origin: OriginMetadata::trusted(text, "org_standards"),
        })
        .collect();
    let project_chunks: Vec<ContextChunk> = inputs
        .project_manifest
        .iter()
        .take(3)
        .map(|(doc_id, text)| ContextChunk {
            source: "tool_contract".into(),
            text: text.clone(),
            score: 0.95,
            collection: String::new(),
            doc_id: doc_id.clone(),
            origin: OriginMetadata::trusted(text, "project_manifest"),
        })
        .collect();

    let context_conflicts = detect_tier_conflicts(&org_chunks, &project_chunks);

    let mut pinned = build_pinned(inputs, org_chunks, project_chunks);
    for conflict in &context_conflicts {
        pinned.push(synthetic_conflict_chunk(conflict));
    }

    // Retrieval trim: top-k by rank, bounded by the character budget, with
    // sanitization applied before inclusion.
    let mut retrieved: Vec<ContextChunk> = Vec::new();
    let mut excluded: Vec<ExcludedChunk> = Vec::new();
    let mut sanitization_actions: Vec<SanitizationAction> = Vec::new();
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut chars_used = 0usize;

    for (index, chunk) in inputs.retrieval.iter().enumerate() {
        let doc_id = if chunk.source.is_empty() {
            format!("rag_{index}")
        } else {
            chunk.source.clone()
        };
        let score = chunk.ranking_score();
        let head: String = chunk.text.chars().take(80).collect();
        let dedup_key = (doc_id.clone(), head);
        if seen.contains(&dedup_key) {
            excluded.push(ExcludedChunk {
                doc_id,
                reason: ExclusionReason::Duplicate,
                score,
                text_snippet: snippet(&chunk.text),
            });
            continue;
        }
        seen.insert(dedup_key);

        let mut text = chunk.text.clone();
        if config.injection_scan_enabled {
            let (sanitized, action) = sanitize_chunk(&doc_id, &text, config.injection_action);
            if let Some(action) = action {
                sanitization_actions.push(action);
            }
            match sanitized {
                Some(t) => text = t,
                None => {
                    // Blocked by the sanitizer; not an exclusion-by-rank,
                    // the action record is the audit trail.
                    continue;
                }
            }
        }

        let exceeds_budget = config.retrieval_budget_chars > 0
            && chars_used + text.len() > config.retrieval_budget_chars;
        if retrieved.len() < config.top_k && !exceeds_budget {
            chars_used += text.len();
            retrieved.push(ContextChunk {
                source: "rag".into(),
                text,
                score,
                collection: chunk.collection.clone(),
                doc_id,
                origin: OriginMetadata::untrusted("rag"),
            });
        } else {
            excluded.push(ExcludedChunk {
                doc_id,
                reason: if exceeds_budget {
                    ExclusionReason::BudgetExceeded
                } else {
                    ExclusionReason::BelowThreshold
                },
                score,
                text_snippet: snippet(&chunk.text),
            });
        }
    }

    // Trusted-vs-untrusted conflicts: stated policy against repository
    // content.
    let untrusted_combined: String = retrieved
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let conflict_warnings = detect_policy_conflicts(&pinned, &untrusted_combined);

    let context_hash = compute_context_hash(&pinned, &retrieved);
    let total_tokens_estimate = pinned
        .iter()
        .chain(retrieved.iter())
        .map(|c| c.text.split_whitespace().count() * 2)
        .sum();

    let user_head: String = inputs.user_id.chars().take(8).collect();
    let context_id = format!("{user_head}_{}", inputs.iteration);
    let hash_head: String = context_hash.chars().take(8).collect();
    let snapshot_version = format!("turn_{}_v{hash_head}", inputs.iteration);

    let budget_alert = excluded
        .iter()
        .find(|e| {
            e.reason == ExclusionReason::BudgetExceeded && e.score >= config.budget_alert_threshold
        })
        .map(|e| {
            format!(
                "I have more relevant documentation on {} (score {:.2}), but I've reached my \
                 context limit. Would you like me to swap current context for the excluded \
                 material?",
                e.doc_id, e.score
            )
        })
        .unwrap_or_default();

    // Jaccard drift against the prior pack signals a context pivot worth
    // surfacing to the user.
    let context_resync_message = match (&inputs.prev_pack, inputs.iteration) {
        (Some(prev), iteration) if iteration > 0 => {
            let prev_ids = prev.doc_ids();
            let curr_ids: BTreeSet<String> = pinned
                .iter()
                .chain(retrieved.iter())
                .map(|c| c.doc_id.clone())
                .filter(|id| !id.is_empty())
                .collect();
            if jaccard(&prev_ids, &curr_ids) < config.drift_jaccard_threshold {
                "Note: based on the build errors, I have pivoted my focus. The context has \
                 shifted significantly. Review the updated plan?"
                    .to_string()
            } else {
                String::new()
            }
        }
        _ => String::new(),
    };

    ContextPack {
        pinned,
        retrieved,
        excluded,
        context_hash,
        total_tokens_estimate,
        context_id,
        snapshot_version,
        sanitization_actions,
        conflict_warnings,
        context_conflicts,
        budget_alert,
        context_resync_message,
        trust_policy_version: "1".into(),
    }
}

fn build_pinned(
    inputs: &PackInputs,
    org_chunks: Vec<ContextChunk>,
    project_chunks: Vec<ContextChunk>,
) -> Vec<ContextChunk> {
    let mut chunks = Vec::with_capacity(4 + org_chunks.len() + project_chunks.len());

    // Tier 1: global invariants.
    let output_format = "Respond with valid JSON. Include code, explanation, reasoning, \
                         assumptions, confidence, edge_cases_considered, needs_input, \
                         needs_input_question, stop_reason."
        .to_string();
    chunks.push(ContextChunk {
        source: "output_format".into(),
        text: output_format.clone(),
        score: 1.0,
        collection: String::new(),
        doc_id: "invariant_output_format".into(),
        origin: OriginMetadata::trusted(&output_format, "output_format"),
    });
    let sandbox_contract = format!(
        "Target language: {}. The sandbox has no network access. Use `set -euo pipefail` for bash.",
        inputs.target_language
    );
    chunks.push(ContextChunk {
        source: "tool_contract".into(),
        text: sandbox_contract.clone(),
        score: 1.0,
        collection: String::new(),
        doc_id: "invariant_sandbox".into(),
        origin: OriginMetadata::trusted(&sandbox_contract, "tool_contract"),
    });

    // Tier 2 and Tier 3.
    chunks.extend(org_chunks);
    chunks.extend(project_chunks);

    // Tier 4: session invariants.
    if !inputs.task_description.is_empty() {
        let task_head: String = inputs.task_description.chars().take(500).collect();
        let mut session_text = format!("Current task: {task_head}");
        if let Some(plan) = &inputs.plan {
            if !plan.steps.is_empty() {
                let steps: Vec<String> = plan
                    .steps
                    .iter()
                    .take(5)
                    .map(|s| s.action.chars().take(80).collect())
                    .collect();
                session_text.push_str("\nPlanner steps: ");
                session_text.push_str(&steps.join("; "));
            }
        }
        chunks.push(ContextChunk {
            source: "tool_contract".into(),
            text: session_text.clone(),
            score: 0.9,
            collection: String::new(),
            doc_id: "invariant_session".into(),
            origin: OriginMetadata::trusted(&session_text, "session"),
        });
    }
    chunks
}

/// The synthetic chunk injected on a Tier 2 / Tier 3 conflict: Tier 3
/// overrides for the session, and the worker must surface the conflict in
/// `blocking_issues` or `residual_risks`, never resolve it silently.
fn synthetic_conflict_chunk(conflict: &ContextConflict) -> ContextChunk {
    let text = format!(
        "[SYSTEM WARNING]: Conflict detected between the organization standard (Tier 2) and the \
         project manifest (Tier 3) regarding {}. Tier 3 overrides Tier 2 for this session, but \
         you must note this in 'residual_risks' or 'blocking_issues'. Org: {}. Project: {}. {}",
        conflict.feature, conflict.org_value, conflict.project_value, conflict.resolution
    );
    ContextChunk {
        source: "tool_contract".into(),
        text: text.clone(),
        score: 1.0,
        collection: String::new(),
        doc_id: format!("conflict_{}", conflict.feature),
        origin: OriginMetadata::trusted(&text, "synthetic_conflict"),
    }
}

fn python_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)python\s*=?\s*['\x22]?3\.(\d+)").expect("static pattern"))
}

/// Tier 2 vs Tier 3 conflict heuristics: container runtime and language
/// version.
#[must_use]
pub fn detect_tier_conflicts(
    org: &[ContextChunk],
    project: &[ContextChunk],
) -> Vec<ContextConflict> {
    let mut conflicts = Vec::new();
    let org_text: String = org.iter().map(|c| c.text.to_lowercase()).collect::<Vec<_>>().join(" ");
    let proj_text: String = project
        .iter()
        .map(|c| c.text.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    if org_text.is_empty() || proj_text.is_empty() {
        return conflicts;
    }

    let org_docker = org_text.contains("docker");
    let org_podman = org_text.contains("podman");
    let proj_docker = proj_text.contains("docker");
    let proj_podman = proj_text.contains("podman");
    if (org_docker && proj_podman && !proj_docker) || (org_podman && proj_docker && !proj_podman) {
        conflicts.push(ContextConflict {
            feature: "container_runtime".into(),
            org_value: if org_docker { "Docker" } else { "Podman" }.into(),
            project_value: if proj_podman { "Podman" } else { "Docker" }.into(),
            severity: ConflictSeverity::Warning,
            resolution: "Tier 3 override applied for this session; surface the conflict."
                .into(),
        });
    }

    let org_py = python_version_re().captures(&org_text);
    let proj_py = python_version_re().captures(&proj_text);
    if let (Some(o), Some(p)) = (org_py, proj_py) {
        if o[1] != p[1] {
            conflicts.push(ContextConflict {
                feature: "python_version".into(),
                org_value: format!("Python 3.{}", &o[1]),
                project_value: format!("Python 3.{}", &p[1]),
                severity: ConflictSeverity::Warning,
                resolution: "Tier 3 override applied for this session; surface the conflict."
                    .into(),
            });
        }
    }
    conflicts
}

/// Trusted-policy vs untrusted-content conflicts.
#[must_use]
pub fn detect_policy_conflicts(
    trusted: &[ContextChunk],
    untrusted_combined: &str,
) -> Vec<ConflictWarning> {
    let mut warnings = Vec::new();
    let untrusted_lower = untrusted_combined.to_lowercase();
    if untrusted_lower.is_empty() {
        return warnings;
    }
    for chunk in trusted {
        if chunk.origin.origin != Origin::Trusted {
            continue;
        }
        let text_lower = chunk.text.to_lowercase();
        if let Some(claimed) = python_version_re().captures(&text_lower) {
            if let Some(repo) = python_version_re().captures(&untrusted_lower) {
                if claimed[1] != repo[1] {
                    warnings.push(ConflictWarning {
                        trusted_claim: format!("Policy states Python 3.{}", &claimed[1]),
                        untrusted_evidence: format!("Repository specifies Python 3.{}", &repo[1]),
                        suggestion: "Flag as blocking_issue; do not override the repo version \
                                     arbitrarily."
                            .into(),
                    });
                }
            }
        }
        if text_lower.contains("docker") && untrusted_lower.contains("podman") {
            warnings.push(ConflictWarning {
                trusted_claim: "Policy mentions Docker".into(),
                untrusted_evidence: "Repository references Podman".into(),
                suggestion: "Flag as blocking_issue; clarify the container runtime with the user."
                    .into(),
            });
        }
    }
    warnings
}

/// Jaccard similarity of two doc-id sets.
#[must_use]
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

fn compute_context_hash(pinned: &[ContextChunk], retrieved: &[ContextChunk]) -> String {
    let mut content = format!("pinned:{}|retrieved:{}", pinned.len(), retrieved.len());
    for chunk in pinned.iter().chain(retrieved.iter()) {
        let head: String = chunk.text.chars().take(100).collect();
        content.push_str(&format!("|{}:{head}", chunk.doc_id));
    }
    let full = compact_hash(&content);
    full.chars().take(16).collect()
}

fn snippet(text: &str) -> String {
    text.chars().take(200).collect()
}

// ── Retry pivot helpers ────────────────────────────────────────────────

fn error_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(ORA-\d+|E\d{4}|ENOENT|ECONNREFUSED|ETIMEDOUT|ESRCH|EACCES)\b")
            .expect("static pattern")
    })
}

fn module_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:ImportError|ModuleNotFoundError|No module named)\s+['"]?(\w+(?:\.\w+)*)['"]?"#)
            .expect("static pattern")
    })
}

fn symbol_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:name|undefined reference to)\s+['`]?(\w+)['`]?").expect("static pattern")
    })
}

/// Extract error codes, module names and unresolved symbols from stderr
/// for the targeted re-query on retry.
#[must_use]
pub fn extract_stderr_entities(stderr: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();
    let mut push = |s: String| {
        if !s.is_empty() && !entities.contains(&s) {
            entities.push(s);
        }
    };
    for cap in error_code_re().captures_iter(stderr) {
        push(cap[1].to_string());
    }
    for cap in module_re().captures_iter(stderr) {
        push(cap[1].split('.').next().unwrap_or_default().to_string());
    }
    for cap in symbol_re().captures_iter(stderr) {
        push(cap[1].to_string());
    }
    entities.truncate(10);
    entities
}

/// The last substantial line of an execution error, for use as a fallback
/// re-query when no entities were extracted.
#[must_use]
pub fn extract_error_excerpt(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.len() > 10)
        .map(|l| l.chars().take(300).collect())
        .unwrap_or_default()
}

/// Doc ids of previously excluded chunks whose snippets match stderr
/// keywords; these get promoted on the retry pack.
#[must_use]
pub fn promotable_doc_ids(prev_pack: &ContextPack, stderr: &str) -> BTreeSet<String> {
    let stderr_lower = stderr.to_lowercase();
    prev_pack
        .excluded
        .iter()
        .filter(|e| !e.doc_id.is_empty() && !e.text_snippet.is_empty())
        .filter(|e| {
            e.text_snippet
                .to_lowercase()
                .split_whitespace()
                .take(15)
                .any(|kw| kw.len() > 3 && stderr_lower.contains(kw))
        })
        .map(|e| e.doc_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PackInputs {
        PackInputs {
            task_description: "write a csv parser".into(),
            target_language: "python".into(),
            user_id: "alice".into(),
            retrieval: vec![
                RetrievedChunk {
                    text: "Use the csv module for parsing.".into(),
                    source: "doc_a".into(),
                    fusion_score: 0.8,
                    ..Default::default()
                },
                RetrievedChunk {
                    text: "Pandas read_csv handles most dialects.".into(),
                    source: "doc_b".into(),
                    fusion_score: 0.6,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn pack_building_is_deterministic() {
        let config = CuratorConfig::default();
        let a = build_pack(&inputs(), &config);
        let b = build_pack(&inputs(), &config);
        assert_eq!(a.context_hash, b.context_hash);
        assert_eq!(a, b);
    }

    #[test]
    fn trust_labels_are_disjoint_by_origin() {
        let pack = build_pack(&inputs(), &CuratorConfig::default());
        assert!(pack
            .pinned
            .iter()
            .all(|c| c.origin.origin == Origin::Trusted && !c.origin.content_hash.is_empty()));
        assert!(pack
            .retrieved
            .iter()
            .all(|c| c.origin.origin == Origin::Untrusted && c.origin.content_hash.is_empty()));
    }

    #[test]
    fn top_k_trim_excludes_with_reason() {
        let mut config = CuratorConfig::default();
        config.top_k = 1;
        let pack = build_pack(&inputs(), &config);
        assert_eq!(pack.retrieved.len(), 1);
        assert_eq!(pack.excluded.len(), 1);
        assert_eq!(pack.excluded[0].reason, ExclusionReason::BelowThreshold);
    }

    #[test]
    fn budget_exceeded_high_score_raises_alert() {
        let mut config = CuratorConfig::default();
        config.retrieval_budget_chars = 35;
        let mut input = inputs();
        input.retrieval[1].fusion_score = 0.95;
        let pack = build_pack(&input, &config);
        assert!(!pack.budget_alert.is_empty());
        assert!(pack.budget_alert.contains("doc_b"));
    }

    #[test]
    fn tier_conflict_injects_synthetic_chunk() {
        let mut input = inputs();
        input.org_standards = vec![(
            "org_1".into(),
            "arch".into(),
            "All services run on Docker.".into(),
        )];
        input.project_manifest = vec![("proj_1".into(), "runtime: podman".into())];
        let pack = build_pack(&input, &CuratorConfig::default());
        assert_eq!(pack.context_conflicts.len(), 1);
        assert!(pack
            .pinned
            .iter()
            .any(|c| c.doc_id == "conflict_container_runtime"));
    }

    #[test]
    fn drift_below_threshold_sets_resync_message() {
        let config = CuratorConfig::default();
        let first = build_pack(&inputs(), &config);
        let mut pivoted = PackInputs {
            iteration: 1,
            prev_pack: Some(first),
            retrieval: vec![RetrievedChunk {
                text: "Completely different material.".into(),
                source: "doc_z".into(),
                fusion_score: 0.9,
                ..Default::default()
            }],
            // A different task shifts even the pinned session chunk.
            task_description: "tune the garbage collector".into(),
            target_language: "go".into(),
            user_id: "alice".into(),
            ..Default::default()
        };
        // Pinned invariants overlap, so drop the threshold high enough to
        // trip on the retrieval swap.
        let mut config = config;
        config.drift_jaccard_threshold = 0.99;
        let pack = build_pack(&pivoted, &config);
        assert!(!pack.context_resync_message.is_empty());
        pivoted.iteration = 0;
        let pack0 = build_pack(&pivoted, &config);
        assert!(pack0.context_resync_message.is_empty());
    }

    #[test]
    fn stderr_entities_cover_codes_modules_symbols() {
        let stderr = "ModuleNotFoundError: No module named 'requests'\n\
                      error E0507 cannot move\nname 'frobnicate' is not defined";
        let entities = extract_stderr_entities(stderr);
        assert!(entities.contains(&"requests".to_string()));
        assert!(entities.contains(&"E0507".to_string()));
        assert!(entities.contains(&"frobnicate".to_string()));
    }

    #[test]
    fn promotion_matches_snippet_keywords() {
        let pack = ContextPack {
            excluded: vec![ExcludedChunk {
                doc_id: "doc_x".into(),
                reason: ExclusionReason::BelowThreshold,
                score: 0.4,
                text_snippet: "handling ImportError for optional dependencies".into(),
            }],
            ..ContextPack::default()
        };
        let promoted = promotable_doc_ids(&pack, "ImportError: cannot import name 'foo'");
        assert!(promoted.contains("doc_x"));
    }
}
