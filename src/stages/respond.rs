//! Respond stage: the terminal assembler.
//!
//! Always produces a user-addressable message: error explanations,
//! clarification questions, plan acknowledgements, or the final artifact
//! with its safety analysis. Pending questions are parked here, at the
//! moment they are actually surfaced to the user, and the conversation
//! memory records both sides of the turn.

use async_trait::async_trait;
use serde_json::json;

use super::StageServices;
use crate::graph::{Stage, StageContext, StageError};
use crate::message::{Message, Role};
use crate::state::{NodeTrace, RequestState, RiskLevel, StageUpdate};
use crate::types::{StageKind, StageOutcome};

pub struct RespondStage {
    services: StageServices,
}

impl RespondStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }

    fn risk_icon(level: RiskLevel) -> &'static str {
        match level {
            RiskLevel::Low => "~",
            RiskLevel::Medium => "!",
            RiskLevel::High => "!!",
            RiskLevel::Critical => "!!!",
        }
    }

    fn assemble(&self, state: &RequestState) -> String {
        if let Some(error) = &state.error {
            let mut content =
                format!("I encountered an issue while processing your request: {error}");
            if !state.generated_code.is_empty() {
                content.push_str(&format!(
                    "\n\nPartial result:\n```{}\n{}\n```",
                    state.target_language, state.generated_code
                ));
            }
            return content;
        }

        if state.needs_clarification {
            let mut content = state
                .clarification_question
                .clone()
                .unwrap_or_else(|| "Could you clarify what you need?".to_string());
            if !state.clarification_options.is_empty() {
                content.push_str("\n\nOptions:");
                for option in &state.clarification_options {
                    content.push_str(&format!("\n- {option}"));
                }
            }
            return content;
        }
        if state.needs_input {
            if let Some(question) = &state.needs_input_question {
                return question.clone();
            }
        }

        let mut parts = Vec::new();
        if !state.generated_code.is_empty() {
            parts.push(format!(
                "```{}\n{}\n```",
                state.target_language, state.generated_code
            ));
        } else if !state.patch_ops.is_empty() {
            let mut patch = String::from("Proposed changes:\n");
            for op in &state.patch_ops {
                patch.push_str(&format!("- {} `{}`\n", op.op.as_str(), op.path));
            }
            parts.push(patch);
        }
        if !state.code_explanation.is_empty() {
            parts.push(format!("\n**Approach:** {}", state.code_explanation));
        }
        if !state.what_if_analyses.is_empty() {
            let mut safety = String::from("\n**Safety Analysis:**");
            for what_if in &state.what_if_analyses {
                safety.push_str(&format!(
                    "\n- [{}] {}: {}",
                    Self::risk_icon(what_if.risk_level),
                    what_if.scenario,
                    what_if.explanation
                ));
                if let Some(mitigation) = &what_if.suggested_mitigation {
                    safety.push_str(&format!("\n  Mitigation: {mitigation}"));
                }
            }
            parts.push(safety);
        }
        if !state.residual_risks.is_empty() {
            let mut risks = String::from("\n**Residual risks:**");
            for risk in &state.residual_risks {
                risks.push_str(&format!("\n- {risk}"));
            }
            parts.push(risks);
        }
        if let Some(pack) = &state.context_pack {
            if !pack.context_resync_message.is_empty() {
                parts.push(format!("\n{}", pack.context_resync_message));
            }
            if !pack.budget_alert.is_empty() {
                parts.push(format!("\n{}", pack.budget_alert));
            }
        }
        if parts.is_empty() {
            "I processed your request but have no output to show.".to_string()
        } else {
            parts.join("\n")
        }
    }
}

#[async_trait]
impl Stage for RespondStage {
    fn kind(&self) -> StageKind {
        StageKind::Respond
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        ctx.emit("enter", "assembling the response");
        let content = self.assemble(state);

        // Park the pending question at the moment it is surfaced. At most
        // one exists per user: a new one replaces any prior.
        if let Some(source) = state.pending_source {
            let question = state
                .clarification_question
                .clone()
                .or_else(|| state.needs_input_question.clone())
                .unwrap_or_default();
            if !question.is_empty() {
                self.services.memory.set_pending(
                    &state.user_id,
                    source,
                    question,
                    json!({
                        "task_description": state.task_description,
                        "target_language": state.target_language,
                        "touched_files": state.touched_files,
                    }),
                );
            }
        }

        // Both sides of the turn go into memory.
        if let Some(user_content) = state.last_user_content() {
            let user_content = user_content.to_string();
            self.services
                .memory
                .store_turn(&state.user_id, Role::User, &user_content);
        }
        self.services
            .memory
            .store_turn(&state.user_id, Role::Assistant, &content);

        let avg_confidence = if state.node_traces.is_empty() {
            0.0
        } else {
            state.node_traces.iter().map(|t| t.confidence).sum::<f64>()
                / state.node_traces.len() as f64
        };
        tracing::info!(
            has_code = !state.generated_code.is_empty(),
            has_error = state.error.is_some(),
            what_if_count = state.what_if_analyses.len(),
            iterations = state.iteration_count,
            avg_confidence,
            "response assembled"
        );

        Ok(StageUpdate {
            messages: vec![Message::reply(StageKind::Respond, content)],
            ..Default::default()
        }
        .with_trace(NodeTrace::new(
            StageKind::Respond,
            StageOutcome::Success,
            "final response assembled",
            1.0,
        )))
    }
}
