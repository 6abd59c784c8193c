//! Planner stage: step decomposition and the capability manifest.
//!
//! The plan's `touched_files` list is the allowlist the integrity gate
//! enforces on the worker. Plans large enough to cross the approval
//! threshold are surfaced to the user for acknowledgement before any code
//! is generated.

use async_trait::async_trait;
use uuid::Uuid;

use super::{estimate_tokens, token_budget_exhausted, StageServices};
use crate::graph::{Stage, StageContext, StageError};
use crate::message::Message;
use crate::schemas::{parse_validated, PlannerOut};
use crate::state::{ExecutionPlan, NodeTrace, RequestState, StageUpdate};
use crate::types::{PendingSource, StageKind, StageOutcome};

pub struct PlannerStage {
    services: StageServices,
    approval_min_steps: usize,
}

impl PlannerStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        let approval_min_steps = services.policy.plan_approval_min_steps;
        Self {
            services,
            approval_min_steps,
        }
    }

    /// Override the plan-approval threshold (0 disables approval).
    #[must_use]
    pub fn with_approval_min_steps(mut self, steps: usize) -> Self {
        self.approval_min_steps = steps;
        self
    }
}

#[async_trait]
impl Stage for PlannerStage {
    fn kind(&self) -> StageKind {
        StageKind::Planner
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        if token_budget_exhausted(state) {
            return Ok(StageUpdate::new()
                .with_error("Token budget exhausted before planning.")
                .with_trace(NodeTrace::new(
                    StageKind::Planner,
                    StageOutcome::Error,
                    "token budget exhausted",
                    0.0,
                )));
        }
        ctx.emit("enter", "drafting the execution plan");

        let system = format!(
            "You are the planner. Decompose the task into ordered steps and name every file \
             the worker is allowed to touch. Respond with valid JSON: {{steps: [{{id, action, \
             dependencies}}], open_questions, assumptions, reasoning, confidence, \
             touched_files}}. touched_files is a strict allowlist; the worker cannot modify \
             anything outside it.\nTask: {}\nTarget language: {}",
            state.task_description, state.target_language
        );
        let messages = vec![Message::system(system)];
        let request_id = Uuid::new_v4().to_string();
        let raw = super::guarded_complete(&self.services, &messages, &request_id).await?;
        let spent: i64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum::<i64>()
            + estimate_tokens(&raw);

        let out: PlannerOut = match parse_validated(&raw) {
            Ok(out) => out,
            Err(err) => {
                tracing::warn!(%err, "planner output unparseable");
                return Ok(StageUpdate::new()
                    .with_error(format!("Planner output failed validation: {err}"))
                    .with_trace(NodeTrace::new(
                        StageKind::Planner,
                        StageOutcome::Error,
                        "schema validation failed after repair",
                        0.0,
                    )));
            }
        };

        let plan = ExecutionPlan {
            steps: out.steps.clone(),
            open_questions: out.open_questions.clone(),
            assumptions: out.assumptions.clone(),
            touched_files: out.touched_files.clone(),
        };
        let mut update = StageUpdate {
            plan: Some(plan.clone()),
            touched_files: Some(out.touched_files.clone()),
            token_budget_remaining: Some(state.budgets.token_budget_remaining - spent),
            ..Default::default()
        };

        // Plan approval: surface as a pending question instead of running.
        if self.approval_min_steps > 0 && plan.steps.len() >= self.approval_min_steps {
            let summary: Vec<String> = plan
                .steps
                .iter()
                .map(|s| format!("{}. {}", s.id, s.action))
                .collect();
            update.needs_input = Some(true);
            update.needs_input_question = Some(format!(
                "Proposed plan:\n{}\nShall I proceed?",
                summary.join("\n")
            ));
            update.pending_source = Some(Some(PendingSource::Planner));
            return Ok(update.with_trace(NodeTrace::new(
                StageKind::Planner,
                StageOutcome::NeedsRevision,
                "plan awaiting user acknowledgement",
                out.confidence,
            )));
        }

        update.needs_input = Some(false);
        Ok(update.with_trace(NodeTrace::new(
            StageKind::Planner,
            StageOutcome::Success,
            out.reasoning,
            out.confidence,
        )))
    }
}
