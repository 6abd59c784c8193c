//! Supervisor stage: task analysis, clarification checkpoint, routing.
//!
//! The supervisor executes policy the classifier discovered; it refines
//! the task description, decides between planner and worker, and asks for
//! clarification instead of guessing when the request is ambiguous. In
//! guard mode (re-entry after a critic rejection) it may only clarify or
//! forward; it must not downgrade to the planner or overwrite evidence
//! context.

use async_trait::async_trait;
use uuid::Uuid;

use super::{estimate_tokens, token_budget_exhausted, StageServices};
use crate::graph::{Stage, StageContext, StageError};
use crate::message::Message;
use crate::schemas::{parse_validated, SupervisorOut};
use crate::state::{NodeTrace, RequestState, StageUpdate};
use crate::types::{PendingSource, StageKind, StageOutcome, TaskSize};

pub struct SupervisorStage {
    services: StageServices,
}

impl SupervisorStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }

    fn build_prompt(&self, state: &RequestState) -> Vec<Message> {
        let mut system = String::from(
            "You are the supervisor of a code-generation pipeline. Analyze the user's request \
             and respond with valid JSON: {task_description, target_language, \
             needs_code_generation, reasoning, assumptions, confidence, needs_clarification, \
             clarification_question, clarification_options, planning_suggested, route_to}. \
             route_to is one of worker|planner|respond. Ask for clarification instead of \
             guessing, but only when genuinely blocked.",
        );
        if state.supervisor_guard {
            system.push_str(
                "\nGuard mode: the critic rejected the previous attempt. You may only clarify \
                 or forward to the worker; do not route to the planner and do not alter \
                 evidence context.",
            );
            if !state.critic_feedback.is_empty() {
                system.push_str("\nCritic feedback: ");
                system.push_str(&state.critic_feedback);
            }
        }

        let history = self.services.memory.history(&state.user_id, Some(10));
        if !history.is_empty() {
            system.push_str("\n## Conversation history\n");
            for line in history {
                system.push_str("- ");
                system.push_str(&line);
                system.push('\n');
            }
        }

        // Known-outcome hints from the fail-fast cache.
        let hints = self
            .services
            .failfast
            .hints(&state.task_description, &state.target_language);
        for hint in hints {
            system.push_str("\n## Prior outcome\n");
            system.push_str(&hint);
            system.push('\n');
        }

        let mut messages = vec![Message::system(system)];
        messages.extend(state.messages.iter().cloned());
        messages
    }
}

#[async_trait]
impl Stage for SupervisorStage {
    fn kind(&self) -> StageKind {
        StageKind::Supervisor
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        if token_budget_exhausted(state) {
            return Ok(StageUpdate::new()
                .with_error("Token budget exhausted before supervision.")
                .with_trace(NodeTrace::new(
                    StageKind::Supervisor,
                    StageOutcome::Error,
                    "token budget exhausted",
                    0.0,
                )));
        }
        ctx.emit("enter", "analyzing the task");

        // Similar past failures across users inform the analysis.
        let similar = self
            .services
            .failure_store
            .find_similar(&state.task_description, 3)
            .await;

        let mut messages = self.build_prompt(state);
        if !similar.is_empty() {
            let mut note = String::from("Similar past failures:\n");
            for failure in &similar {
                note.push_str(&format!(
                    "- [{}] {}\n",
                    failure.error_type,
                    failure.error_output.chars().take(160).collect::<String>()
                ));
            }
            messages.push(Message::system(note));
        }

        let request_id = Uuid::new_v4().to_string();
        let raw = super::guarded_complete(&self.services, &messages, &request_id).await?;
        let spent: i64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum::<i64>()
            + estimate_tokens(&raw);

        let out: SupervisorOut = match parse_validated(&raw) {
            Ok(out) => out,
            Err(err) => {
                // Second failure is terminal for this stage: degrade.
                tracing::warn!(%err, "supervisor output unparseable");
                return Ok(StageUpdate::new()
                    .with_error(format!("Supervisor output failed validation: {err}"))
                    .with_trace(NodeTrace::new(
                        StageKind::Supervisor,
                        StageOutcome::Error,
                        "schema validation failed after repair",
                        0.0,
                    )));
            }
        };

        let mut update = StageUpdate {
            token_budget_remaining: Some(state.budgets.token_budget_remaining - spent),
            ..Default::default()
        };
        if !out.task_description.is_empty() {
            update.task_description = Some(out.task_description.clone());
        }
        if !out.target_language.is_empty() {
            update.target_language = Some(out.target_language.clone());
        }

        // Clarification: bounded by the per-size budget, and never for
        // trivial tasks (hard fence enforced upstream by the classifier).
        let may_ask = state.clarification_budget > 0 && state.task_size != TaskSize::Trivial;
        if out.needs_clarification && may_ask {
            let question = out
                .clarification_question
                .clone()
                .unwrap_or_else(|| "Could you clarify what you need?".to_string());
            update.needs_clarification = Some(true);
            update.clarification_question = Some(question);
            update.clarification_options = Some(out.clarification_options.clone());
            update.clarification_budget = Some(state.clarification_budget - 1);
            update.pending_source = Some(Some(PendingSource::Supervisor));
            return Ok(update.with_trace(NodeTrace::new(
                StageKind::Supervisor,
                StageOutcome::NeedsRevision,
                "asked for clarification",
                out.confidence,
            )));
        }

        let route = match out.route_to.as_deref() {
            Some("respond") => StageKind::Respond,
            Some("planner") if !state.supervisor_guard => StageKind::Planner,
            Some("worker") => StageKind::Worker,
            _ => {
                if (state.plan_required || out.planning_suggested) && !state.supervisor_guard {
                    StageKind::Planner
                } else {
                    StageKind::Worker
                }
            }
        };
        update.route_to = Some(route);
        update.needs_clarification = Some(false);
        // Re-entry consumed the guard; the next rejection re-arms it.
        if state.supervisor_guard {
            update.supervisor_guard = Some(false);
        }

        Ok(update.with_trace(
            NodeTrace::new(
                StageKind::Supervisor,
                StageOutcome::Success,
                out.reasoning,
                out.confidence,
            ),
        ))
    }
}
