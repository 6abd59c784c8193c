//! ContextPack types: the curated, trust-labeled bundle sent to the worker.
//!
//! Pinned chunks are directives (trusted, content-hashed); retrieved
//! chunks are data (untrusted, never hashed). The two sets are disjoint by
//! construction: trust is assigned from origin, never from content.

use serde::{Deserialize, Serialize};

use crate::evidence::compact_hash;

/// Trust origin of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Trusted,
    Untrusted,
}

/// Provenance metadata enforcing the trust boundary: only trusted chunks
/// carry a content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    pub origin: Origin,
    /// SHA-256 prefix of the text for trusted chunks; empty for untrusted.
    #[serde(default)]
    pub content_hash: String,
    /// e.g. `"tool_contract"`, `"rag"`, `"org_standards"`.
    #[serde(default)]
    pub source_label: String,
}

impl OriginMetadata {
    /// Trusted metadata with the content hash filled in.
    #[must_use]
    pub fn trusted(text: &str, source_label: &str) -> Self {
        Self {
            origin: Origin::Trusted,
            content_hash: compact_hash(text),
            source_label: source_label.to_string(),
        }
    }

    /// Untrusted metadata; the hash stays empty.
    #[must_use]
    pub fn untrusted(source_label: &str) -> Self {
        Self {
            origin: Origin::Untrusted,
            content_hash: String::new(),
            source_label: source_label.to_string(),
        }
    }
}

/// A single chunk in the curated context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    /// e.g. `"output_format"`, `"tool_contract"`, `"arch"`, `"rag"`.
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub collection: String,
    pub doc_id: String,
    pub origin: OriginMetadata,
}

/// Why an available chunk was not sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    BelowThreshold,
    BudgetExceeded,
    Duplicate,
}

/// A chunk available but excluded, kept for audit and for retry promotion
/// (the snippet is matched against stderr keywords on context pivots).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExcludedChunk {
    pub doc_id: String,
    pub reason: ExclusionReason,
    pub score: f64,
    pub text_snippet: String,
}

/// What the sanitizer did to a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizeActionKind {
    Redacted,
    Removed,
    Logged,
}

/// Record of one sanitization action for injection hardening.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SanitizationAction {
    pub chunk_id: String,
    pub action: SanitizeActionKind,
    pub reason: String,
}

/// Trusted policy conflicting with untrusted repository content. The
/// worker must surface these, never resolve them silently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictWarning {
    pub trusted_claim: String,
    pub untrusted_evidence: String,
    pub suggestion: String,
}

/// Severity grading for tier conflicts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Informational,
    #[default]
    Warning,
    Blocking,
}

/// Organization standard (Tier 2) vs project manifest (Tier 3) conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextConflict {
    /// e.g. `"container_runtime"`, `"python_version"`.
    pub feature: String,
    pub org_value: String,
    pub project_value: String,
    pub severity: ConflictSeverity,
    pub resolution: String,
}

/// The curated pack sent to the worker. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    /// Tiered trusted chunks, in tier order.
    pub pinned: Vec<ContextChunk>,
    /// Ranked untrusted retrieval results.
    pub retrieved: Vec<ContextChunk>,
    /// Audit trail of what was held back, and why.
    pub excluded: Vec<ExcludedChunk>,
    pub context_hash: String,
    pub total_tokens_estimate: usize,
    /// Stable id for drift tracking across turns.
    pub context_id: String,
    /// `turn_<iteration>_v<hash8>`.
    pub snapshot_version: String,
    pub sanitization_actions: Vec<SanitizationAction>,
    pub conflict_warnings: Vec<ConflictWarning>,
    pub context_conflicts: Vec<ContextConflict>,
    /// Non-empty when a high-score chunk was excluded for budget.
    pub budget_alert: String,
    /// Non-empty when Jaccard similarity to the prior pack fell below the
    /// drift threshold.
    pub context_resync_message: String,
    pub trust_policy_version: String,
}

impl ContextPack {
    /// All trusted chunks (the pinned set).
    #[must_use]
    pub fn trusted_chunks(&self) -> &[ContextChunk] {
        &self.pinned
    }

    /// All untrusted chunks (the retrieved set).
    #[must_use]
    pub fn untrusted_chunks(&self) -> &[ContextChunk] {
        &self.retrieved
    }

    /// Doc ids across both sets, for Jaccard drift comparison.
    #[must_use]
    pub fn doc_ids(&self) -> std::collections::BTreeSet<String> {
        self.pinned
            .iter()
            .chain(self.retrieved.iter())
            .map(|c| c.doc_id.clone())
            .filter(|id| !id.is_empty())
            .collect()
    }
}

impl Default for ContextPack {
    fn default() -> Self {
        Self {
            pinned: Vec::new(),
            retrieved: Vec::new(),
            excluded: Vec::new(),
            context_hash: String::new(),
            total_tokens_estimate: 0,
            context_id: String::new(),
            snapshot_version: String::new(),
            sanitization_actions: Vec::new(),
            conflict_warnings: Vec::new(),
            context_conflicts: Vec::new(),
            budget_alert: String::new(),
            context_resync_message: String::new(),
            trust_policy_version: "1".to_string(),
        }
    }
}
