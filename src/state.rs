//! Request state: the typed contract shared by every stage.
//!
//! One [`RequestState`] is created per traversal. Stages never mutate it
//! directly; they return a [`StageUpdate`] that the runner merges with
//! [`RequestState::apply`]. The merge is monotonic:
//!
//! - append-only channels (`node_traces`, `tool_refs`, `stages_passed`,
//!   `failure_ids_seen`, `revision_strategies_tried`) concatenate, with set
//!   semantics where the invariant requires it;
//! - scalar fields take the latest non-`None` value;
//! - `iteration_count` never decreases.
//!
//! # Examples
//!
//! ```
//! use synesis::message::Message;
//! use synesis::state::{RequestState, StageUpdate};
//!
//! let mut state = RequestState::new("run-1", "alice", vec![Message::user("hi")]);
//! state.apply(StageUpdate {
//!     generated_code: Some("print('hi')".into()),
//!     ..Default::default()
//! });
//! assert_eq!(state.generated_code, "print('hi')");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ContextPack;
use crate::evidence::{CodeRef, ToolRef};
use crate::gate::IntegrityFailure;
use crate::message::Message;
use crate::sandbox::SandboxResult;
use crate::strategy::{RevisionStrategy, StrategyConstraints};
use crate::types::{
    FailureKind, InteractionMode, MessageOrigin, PendingSource, PromptTier, StageKind,
    StageOutcome, StopReason, TaskSize,
};

/// A structured edit to one file. Enables LOC-delta and path-policy
/// enforcement without parsing unified diffs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    pub path: String,
    pub op: PatchAction,
    #[serde(default)]
    pub text: String,
}

/// The allowed patch operations. Anything else is rejected by the gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchAction {
    Add,
    #[default]
    Modify,
    Delete,
}

impl PatchAction {
    /// Wire/sort label. Ordering by this label gives the canonical
    /// `(path, op)` apply order.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchAction::Add => "add",
            PatchAction::Modify => "modify",
            PatchAction::Delete => "delete",
        }
    }
}

/// Evidence-gap mode: a structured experiment whose results are
/// novelty-checkable, instead of a free-form script.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub expected_artifacts: Vec<String>,
    #[serde(default)]
    pub success_criteria: String,
}

/// A single step in the planner's execution plan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub dependencies: Vec<u32>,
}

/// The planner's output: ordered steps plus the `touched_files` capability
/// manifest the integrity gate validates the worker against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub touched_files: Vec<String>,
}

/// Risk grading used by what-if analyses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A single what-if scenario produced by the critic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatIf {
    pub scenario: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub suggested_mitigation: Option<String>,
}

/// Per-request retrieval configuration, overridable from the API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub strategy: String,
    pub reranker: String,
    pub top_k: usize,
    /// Retrieval fetches `top_k * overfetch` candidates before trimming.
    pub overfetch: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            strategy: "hybrid".into(),
            reranker: "bge".into(),
            top_k: 5,
            overfetch: 3,
        }
    }
}

/// A retrieved document chunk with provenance and ranking scores.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub vector_score: f64,
    #[serde(default)]
    pub bm25_score: f64,
    #[serde(default)]
    pub fusion_score: f64,
    #[serde(default)]
    pub rerank_score: Option<f64>,
}

impl RetrievedChunk {
    /// Effective ranking score: rerank score when the reranker ran, else
    /// the rank-fusion score.
    #[must_use]
    pub fn ranking_score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.fusion_score)
    }
}

/// Audit record for a single stage execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeTrace {
    pub stage: StageKind,
    pub reasoning: String,
    #[serde(default)]
    pub assumptions: Vec<String>,
    pub confidence: f64,
    pub outcome: StageOutcome,
    #[serde(default)]
    pub latency_ms: f64,
    pub at: DateTime<Utc>,
}

impl NodeTrace {
    /// Build a trace stamped with the current time.
    pub fn new(
        stage: StageKind,
        outcome: StageOutcome,
        reasoning: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            stage,
            reasoning: reasoning.into(),
            assumptions: Vec::new(),
            confidence,
            outcome,
            latency_ms: 0.0,
            at: Utc::now(),
        }
    }

    /// Attach the measured stage latency.
    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Budget counters carried in state. Limits live in [`crate::config::Settings`];
/// once a counter exhausts its limit, no stage that consumes that budget
/// runs again in the same traversal.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Budgets {
    pub token_budget_remaining: i64,
    pub sandbox_minutes_used: f64,
    pub lsp_calls_used: u32,
    pub evidence_experiments_count: u32,
}

/// Primary state flowing through the traversal graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestState {
    // Identity & conversation
    pub run_id: String,
    pub user_id: String,
    pub messages: Vec<Message>,
    pub conversation_history: Vec<String>,

    // Classification
    pub task_description: String,
    pub target_language: String,
    pub task_size: TaskSize,
    pub interaction_mode: InteractionMode,
    pub message_origin: MessageOrigin,
    pub worker_prompt_tier: PromptTier,
    pub bypass_supervisor: bool,
    pub bypass_planner: bool,
    pub plan_required: bool,
    pub clarification_budget: u32,
    pub active_domain_refs: Vec<String>,
    pub defaults_used: Vec<String>,
    pub allowed_tools: Vec<String>,

    // Retrieval & context
    pub rag_context: Vec<String>,
    pub rag_collections_queried: Vec<String>,
    pub retrieval_params: RetrievalParams,
    pub retrieval_results: Vec<RetrievedChunk>,
    pub context_pack: Option<ContextPack>,

    // Planning
    pub plan: Option<ExecutionPlan>,
    pub touched_files: Vec<String>,
    pub target_workspace: String,

    // Generated artifact
    pub generated_code: String,
    pub code_explanation: String,
    pub patch_ops: Vec<PatchOp>,
    pub files_touched: Vec<String>,
    pub unified_diff: Option<String>,
    pub code_ref: Option<CodeRef>,
    pub experiment_plan: Option<ExperimentPlan>,

    // Execution results
    pub execution_result: Option<SandboxResult>,
    pub execution_exit_code: Option<i32>,
    pub execution_lint_passed: bool,
    pub execution_security_passed: bool,
    pub lsp_diagnostics: Vec<String>,
    pub attempt_id: String,

    // Critique
    pub what_if_analyses: Vec<WhatIf>,
    pub critic_approved: Option<bool>,
    pub critic_feedback: String,
    pub residual_risks: Vec<String>,
    pub blocking_issues: Vec<String>,
    pub dark_debt_signal: Option<Value>,

    // Revision loop
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub stages_passed: Vec<String>,
    pub failure_kind: Option<FailureKind>,
    pub failure_ids_seen: Vec<String>,
    pub revision_strategy: Option<RevisionStrategy>,
    pub revision_strategies_tried: Vec<RevisionStrategy>,
    pub revision_constraints: Option<StrategyConstraints>,
    pub strategy_violation: bool,
    pub regressions_intended: Vec<String>,
    pub regression_justification: Option<String>,

    // Control
    pub stop_reason: Option<StopReason>,
    pub needs_input: bool,
    pub needs_input_question: Option<String>,
    pub needs_clarification: bool,
    pub clarification_question: Option<String>,
    pub clarification_options: Vec<String>,
    pub supervisor_guard: bool,
    pub route_to: Option<StageKind>,
    pub resume_from: Option<PendingSource>,
    /// Which stage owns the question currently being asked, so the respond
    /// stage can park it for resumption.
    pub pending_source: Option<PendingSource>,
    pub error: Option<String>,

    // Integrity
    pub integrity_passed: Option<bool>,
    pub integrity_failure: Option<IntegrityFailure>,

    // Evidence
    pub node_traces: Vec<NodeTrace>,
    pub tool_refs: Vec<ToolRef>,

    // Budgets
    pub budgets: Budgets,
}

impl RequestState {
    /// Create the state for a fresh traversal.
    pub fn new(
        run_id: impl Into<String>,
        user_id: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: user_id.into(),
            messages,
            conversation_history: Vec::new(),
            task_description: String::new(),
            target_language: String::new(),
            task_size: TaskSize::default(),
            interaction_mode: InteractionMode::default(),
            message_origin: MessageOrigin::default(),
            worker_prompt_tier: PromptTier::default(),
            bypass_supervisor: false,
            bypass_planner: false,
            plan_required: false,
            clarification_budget: 0,
            active_domain_refs: Vec::new(),
            defaults_used: Vec::new(),
            allowed_tools: Vec::new(),
            rag_context: Vec::new(),
            rag_collections_queried: Vec::new(),
            retrieval_params: RetrievalParams::default(),
            retrieval_results: Vec::new(),
            context_pack: None,
            plan: None,
            touched_files: Vec::new(),
            target_workspace: String::new(),
            generated_code: String::new(),
            code_explanation: String::new(),
            patch_ops: Vec::new(),
            files_touched: Vec::new(),
            unified_diff: None,
            code_ref: None,
            experiment_plan: None,
            execution_result: None,
            execution_exit_code: None,
            execution_lint_passed: true,
            execution_security_passed: true,
            lsp_diagnostics: Vec::new(),
            attempt_id: String::new(),
            what_if_analyses: Vec::new(),
            critic_approved: None,
            critic_feedback: String::new(),
            residual_risks: Vec::new(),
            blocking_issues: Vec::new(),
            dark_debt_signal: None,
            iteration_count: 0,
            max_iterations: 3,
            stages_passed: Vec::new(),
            failure_kind: None,
            failure_ids_seen: Vec::new(),
            revision_strategy: None,
            revision_strategies_tried: Vec::new(),
            revision_constraints: None,
            strategy_violation: false,
            regressions_intended: Vec::new(),
            regression_justification: None,
            stop_reason: None,
            needs_input: false,
            needs_input_question: None,
            needs_clarification: false,
            clarification_question: None,
            clarification_options: Vec::new(),
            supervisor_guard: false,
            route_to: None,
            resume_from: None,
            pending_source: None,
            error: None,
            integrity_passed: None,
            integrity_failure: None,
            node_traces: Vec::new(),
            tool_refs: Vec::new(),
            budgets: Budgets::default(),
        }
    }

    /// Merge a stage's partial update into this state.
    ///
    /// Scalars take the latest non-`None` value; append channels
    /// concatenate. `iteration_count` is clamped to be non-decreasing, and
    /// `stages_passed` / `failure_ids_seen` / `revision_strategies_tried`
    /// keep set semantics while preserving first-seen order.
    pub fn apply(&mut self, update: StageUpdate) {
        macro_rules! set_scalar {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = update.$field {
                    self.$field = v;
                })*
            };
        }
        set_scalar!(
            task_description,
            target_language,
            task_size,
            interaction_mode,
            message_origin,
            worker_prompt_tier,
            bypass_supervisor,
            bypass_planner,
            plan_required,
            clarification_budget,
            active_domain_refs,
            defaults_used,
            allowed_tools,
            rag_context,
            rag_collections_queried,
            retrieval_params,
            retrieval_results,
            touched_files,
            target_workspace,
            generated_code,
            code_explanation,
            patch_ops,
            files_touched,
            execution_exit_code,
            execution_lint_passed,
            execution_security_passed,
            lsp_diagnostics,
            attempt_id,
            what_if_analyses,
            critic_approved,
            critic_feedback,
            residual_risks,
            blocking_issues,
            max_iterations,
            failure_kind,
            revision_strategy,
            revision_constraints,
            strategy_violation,
            regressions_intended,
            stop_reason,
            needs_input,
            needs_clarification,
            clarification_options,
            supervisor_guard,
            integrity_passed,
        );
        // Option-typed scalars on the state itself: Some(inner) replaces.
        if let Some(v) = update.context_pack {
            self.context_pack = Some(v);
        }
        if let Some(v) = update.plan {
            self.plan = Some(v);
        }
        if let Some(v) = update.unified_diff {
            self.unified_diff = Some(v);
        }
        if let Some(v) = update.code_ref {
            self.code_ref = Some(v);
        }
        if let Some(v) = update.experiment_plan {
            self.experiment_plan = Some(v);
        }
        if let Some(v) = update.execution_result {
            self.execution_result = Some(v);
        }
        if let Some(v) = update.dark_debt_signal {
            self.dark_debt_signal = Some(v);
        }
        if let Some(v) = update.regression_justification {
            self.regression_justification = Some(v);
        }
        if let Some(v) = update.needs_input_question {
            self.needs_input_question = Some(v);
        }
        if let Some(v) = update.clarification_question {
            self.clarification_question = Some(v);
        }
        if let Some(v) = update.route_to {
            self.route_to = Some(v);
        }
        if let Some(v) = update.pending_source {
            self.pending_source = v;
        }
        if let Some(v) = update.error {
            self.error = Some(v);
        }
        if let Some(v) = update.integrity_failure {
            self.integrity_failure = v;
        }
        if let Some(v) = update.sandbox_minutes_used {
            self.budgets.sandbox_minutes_used = v;
        }
        if let Some(v) = update.token_budget_remaining {
            self.budgets.token_budget_remaining = v;
        }
        if let Some(v) = update.lsp_calls_used {
            self.budgets.lsp_calls_used = v;
        }
        if let Some(v) = update.evidence_experiments_count {
            self.budgets.evidence_experiments_count = v;
        }

        // Iteration count only moves forward.
        if let Some(it) = update.iteration_count {
            if it > self.iteration_count {
                self.iteration_count = it;
            }
        }

        // Append channels.
        self.messages.extend(update.messages);
        self.node_traces.extend(update.node_traces);
        self.tool_refs.extend(update.tool_refs);
        for stage in update.stages_passed {
            if !self.stages_passed.contains(&stage) {
                self.stages_passed.push(stage);
            }
        }
        for id in update.failure_ids_seen {
            if !self.failure_ids_seen.contains(&id) {
                self.failure_ids_seen.push(id);
            }
        }
        for s in update.revision_strategies_tried {
            if !self.revision_strategies_tried.contains(&s) {
                self.revision_strategies_tried.push(s);
            }
        }
    }

    /// The most recent user-authored message content, if any.
    #[must_use]
    pub fn last_user_content(&self) -> Option<&str> {
        crate::message::last_user_content(&self.messages)
    }

    /// Whether a previously passed stage would regress given the supplied
    /// pass/fail outcome for that stage on this attempt.
    #[must_use]
    pub fn would_regress(&self, stage: &str, passed_now: bool) -> bool {
        !passed_now && self.stages_passed.iter().any(|s| s == stage)
    }
}

/// Partial state update returned by a stage.
///
/// All fields are optional (or append lists); the runner merges them via
/// [`RequestState::apply`]. Stages set only what they own.
#[derive(Clone, Debug, Default)]
pub struct StageUpdate {
    pub task_description: Option<String>,
    pub target_language: Option<String>,
    pub task_size: Option<TaskSize>,
    pub interaction_mode: Option<InteractionMode>,
    pub message_origin: Option<MessageOrigin>,
    pub worker_prompt_tier: Option<PromptTier>,
    pub bypass_supervisor: Option<bool>,
    pub bypass_planner: Option<bool>,
    pub plan_required: Option<bool>,
    pub clarification_budget: Option<u32>,
    pub active_domain_refs: Option<Vec<String>>,
    pub defaults_used: Option<Vec<String>>,
    pub allowed_tools: Option<Vec<String>>,

    pub rag_context: Option<Vec<String>>,
    pub rag_collections_queried: Option<Vec<String>>,
    pub retrieval_params: Option<RetrievalParams>,
    pub retrieval_results: Option<Vec<RetrievedChunk>>,
    pub context_pack: Option<ContextPack>,

    pub plan: Option<ExecutionPlan>,
    pub touched_files: Option<Vec<String>>,
    pub target_workspace: Option<String>,

    pub generated_code: Option<String>,
    pub code_explanation: Option<String>,
    pub patch_ops: Option<Vec<PatchOp>>,
    pub files_touched: Option<Vec<String>>,
    pub unified_diff: Option<String>,
    pub code_ref: Option<CodeRef>,
    pub experiment_plan: Option<ExperimentPlan>,

    pub execution_result: Option<SandboxResult>,
    pub execution_exit_code: Option<Option<i32>>,
    pub execution_lint_passed: Option<bool>,
    pub execution_security_passed: Option<bool>,
    pub lsp_diagnostics: Option<Vec<String>>,
    pub attempt_id: Option<String>,

    pub what_if_analyses: Option<Vec<WhatIf>>,
    pub critic_approved: Option<Option<bool>>,
    pub critic_feedback: Option<String>,
    pub residual_risks: Option<Vec<String>>,
    pub blocking_issues: Option<Vec<String>>,
    pub dark_debt_signal: Option<Value>,

    pub iteration_count: Option<u32>,
    pub max_iterations: Option<u32>,
    pub stages_passed: Vec<String>,
    pub failure_kind: Option<Option<FailureKind>>,
    pub failure_ids_seen: Vec<String>,
    pub revision_strategy: Option<Option<RevisionStrategy>>,
    pub revision_strategies_tried: Vec<RevisionStrategy>,
    pub revision_constraints: Option<Option<StrategyConstraints>>,
    pub strategy_violation: Option<bool>,
    pub regressions_intended: Option<Vec<String>>,
    pub regression_justification: Option<String>,

    pub stop_reason: Option<Option<StopReason>>,
    pub needs_input: Option<bool>,
    pub needs_input_question: Option<String>,
    pub needs_clarification: Option<bool>,
    pub clarification_question: Option<String>,
    pub clarification_options: Option<Vec<String>>,
    pub supervisor_guard: Option<bool>,
    pub route_to: Option<StageKind>,
    pub pending_source: Option<Option<PendingSource>>,
    pub error: Option<String>,

    pub integrity_passed: Option<Option<bool>>,
    pub integrity_failure: Option<Option<IntegrityFailure>>,

    pub messages: Vec<Message>,
    pub node_traces: Vec<NodeTrace>,
    pub tool_refs: Vec<ToolRef>,

    pub token_budget_remaining: Option<i64>,
    pub sandbox_minutes_used: Option<f64>,
    pub lsp_calls_used: Option<u32>,
    pub evidence_experiments_count: Option<u32>,
}

impl StageUpdate {
    /// Empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a trace entry.
    #[must_use]
    pub fn with_trace(mut self, trace: NodeTrace) -> Self {
        self.node_traces.push(trace);
        self
    }

    /// Set the routing hint consumed by the conditional edge.
    #[must_use]
    pub fn with_route(mut self, to: StageKind) -> Self {
        self.route_to = Some(to);
        self
    }

    /// Record a fatal stage error; routing falls through to respond.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
