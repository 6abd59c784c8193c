//! Core vocabulary for the Synesis orchestration graph.
//!
//! This module defines the closed sets the routing engine and state model
//! are built from: stage identifiers, task sizing, failure classification,
//! and the worker's safety stop reasons.
//!
//! # Key Types
//!
//! - [`StageKind`]: identifies a stage in the traversal graph
//! - [`TaskSize`]: the classifier's complexity verdict
//! - [`FailureKind`]: normalized sandbox/gate failure classification
//! - [`StopReason`]: worker-declared reasons to halt instead of guessing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a stage within the traversal graph.
///
/// Stages are fixed at process start; the graph is a value, not a plugin
/// surface. `Respond` is terminal and `End` is the virtual exit used by the
/// runner to detect completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Deterministic intent classification; always runs first.
    EntryClassifier,
    /// Task decomposition and clarification checkpoint.
    Supervisor,
    /// Plan construction with the `touched_files` capability manifest.
    Planner,
    /// Deterministic context-pack assembly before every worker call.
    ContextCurator,
    /// Code generation against the curated context.
    Worker,
    /// Deterministic pre-sandbox policy checkpoint.
    IntegrityGate,
    /// Deep static analysis via the analysis gateway.
    Analyzer,
    /// Isolated execution of the generated artifact.
    Sandbox,
    /// Safety critique: what-if analysis, approval, postmortem.
    Critic,
    /// Terminal stage assembling the user-addressable response.
    Respond,
    /// Virtual exit marker; never executed.
    End,
}

impl StageKind {
    /// Stable snake_case name used in traces, status events, and routing maps.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::EntryClassifier => "entry_classifier",
            StageKind::Supervisor => "supervisor",
            StageKind::Planner => "planner",
            StageKind::ContextCurator => "context_curator",
            StageKind::Worker => "worker",
            StageKind::IntegrityGate => "integrity_gate",
            StageKind::Analyzer => "analyzer",
            StageKind::Sandbox => "sandbox",
            StageKind::Critic => "critic",
            StageKind::Respond => "respond",
            StageKind::End => "end",
        }
    }

    /// Returns `true` once the traversal has nothing left to execute.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageKind::End)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The classifier's complexity verdict for a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSize {
    /// One-file, no-question fast path.
    Trivial,
    /// Default: supervised but unplanned.
    #[default]
    Small,
    /// Routed through the planner with a capability manifest.
    Complex,
}

impl fmt::Display for TaskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskSize::Trivial => write!(f, "trivial"),
            TaskSize::Small => write!(f, "small"),
            TaskSize::Complex => write!(f, "complex"),
        }
    }
}

/// Whether the user wants an artifact or an explanation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    #[default]
    Do,
    Teach,
}

/// Prompt richness tier handed to the worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTier {
    Lite,
    #[default]
    Standard,
    Full,
}

/// Where a message came from. UI helpers (follow-up suggestion prompts,
/// title generators) are classified away from the coding workflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    #[default]
    EndUser,
    UiHelper,
    SystemInternal,
    ToolLog,
}

/// Normalized failure classification driving strategy selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Lint,
    Security,
    Lsp,
    Runtime,
    SpecMismatch,
    IntegrityGate,
}

impl FailureKind {
    /// Stage label used as the fingerprint prefix.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Lint => "lint",
            FailureKind::Security => "security",
            FailureKind::Lsp => "lsp",
            FailureKind::Runtime => "runtime",
            FailureKind::SpecMismatch => "spec_mismatch",
            FailureKind::IntegrityGate => "integrity_gate",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-declared stop reasons. Declaring beats looping: when the worker
/// knows it is blocked it says so instead of burning iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BlockedExternal,
    CannotReproduce,
    UnsafeRequest,
    NeedsScopeExpansion,
}

impl StopReason {
    /// Parse the wire form emitted by the worker schema.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocked_external" => Some(Self::BlockedExternal),
            "cannot_reproduce" => Some(Self::CannotReproduce),
            "unsafe_request" => Some(Self::UnsafeRequest),
            "needs_scope_expansion" => Some(Self::NeedsScopeExpansion),
            _ => None,
        }
    }
}

/// Outcome recorded in a stage trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    NeedsRevision,
    Error,
    Timeout,
}

/// Which stage parked a pending question, so the next request can resume
/// at the right point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingSource {
    Worker,
    Planner,
    Supervisor,
}
