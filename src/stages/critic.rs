//! Critic stage: safety critique, approval, and postmortem analysis.
//!
//! The critic enriches understanding instead of gating on a binary: it
//! produces what-if scenarios with risk levels, records residual risks,
//! and judges declared regressions. In postmortem mode (same failure
//! repeated, or iterations exhausted) it explains why the loop stopped
//! and emits an advisory dark-debt signal instead of approving a retry.

use async_trait::async_trait;
use uuid::Uuid;

use super::{estimate_tokens, token_budget_exhausted, StageServices};
use crate::graph::{Stage, StageContext, StageError};
use crate::message::Message;
use crate::schemas::{parse_validated, CriticOut};
use crate::state::{NodeTrace, RequestState, StageUpdate};
use crate::types::{StageKind, StageOutcome};

pub struct CriticStage {
    services: StageServices,
}

impl CriticStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }

    fn postmortem(&self, state: &RequestState) -> bool {
        let failed = state.execution_exit_code.is_some_and(|c| c != 0);
        failed
            && (state.iteration_count >= state.max_iterations
                || state.route_to == Some(StageKind::Critic))
    }

    fn build_prompt(&self, state: &RequestState, postmortem: bool) -> Vec<Message> {
        let mut system = String::from(
            "You are the critic reviewing a generated code artifact. Respond with valid JSON: \
             {what_if_analyses: [{scenario, risk_level, explanation, suggested_mitigation}], \
             overall_assessment, approved, revision_feedback, confidence, reasoning, \
             blocking_issues, residual_risks, dark_debt_signal}. risk_level is one of \
             low|medium|high|critical.",
        );
        if postmortem {
            system.push_str(
                "\nPostmortem mode: the revision loop has stopped (repeated failure or \
                 exhausted iterations). Do not request another retry. Explain what failed, why \
                 retries could not fix it, and emit dark_debt_signal = {failure_pattern, \
                 consistent_failures} if the failure looks structural.",
            );
        }
        if !state.regressions_intended.is_empty() {
            system.push_str(&format!(
                "\nThe worker declared intended regressions for {:?} with justification: {}. \
                 Judge whether the justification holds; reject if it does not.",
                state.regressions_intended,
                state
                    .regression_justification
                    .as_deref()
                    .unwrap_or("(none)")
            ));
        }
        if let Some(pack) = &state.context_pack {
            if !pack.context_conflicts.is_empty() {
                system.push_str(
                    "\nThe context pack carried tier conflicts; verify the worker surfaced \
                     them in blocking_issues or residual_risks.",
                );
            }
        }

        let mut user = format!(
            "Task: {}\nLanguage: {}\n\nCode:\n```\n{}\n```",
            state.task_description, state.target_language, state.generated_code
        );
        if let Some(result) = &state.execution_result {
            user.push_str(&format!(
                "\n\nSandbox: exit={}, lint={}, security={}",
                result.exit_code,
                if result.lint.passed { "pass" } else { "fail" },
                if result.security.passed { "pass" } else { "fail" },
            ));
            if result.exit_code != 0 {
                let head: String = result.execution.output.chars().take(600).collect();
                user.push_str(&format!("\nOutput:\n{head}"));
            }
        }
        vec![Message::system(system), Message::user(user)]
    }
}

#[async_trait]
impl Stage for CriticStage {
    fn kind(&self) -> StageKind {
        StageKind::Critic
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        if token_budget_exhausted(state) {
            // Out of tokens: pass the artifact through unreviewed rather
            // than fail it, with the gap on record.
            return Ok(StageUpdate {
                critic_approved: Some(Some(true)),
                critic_feedback: Some("Review skipped: token budget exhausted.".into()),
                ..Default::default()
            }
            .with_trace(NodeTrace::new(
                StageKind::Critic,
                StageOutcome::Error,
                "token budget exhausted, review skipped",
                0.0,
            )));
        }

        let postmortem = self.postmortem(state);
        ctx.emit(
            "enter",
            if postmortem {
                "running postmortem review"
            } else {
                "reviewing the result"
            },
        );

        let messages = self.build_prompt(state, postmortem);
        let request_id = Uuid::new_v4().to_string();
        let raw = super::guarded_complete(&self.services, &messages, &request_id).await?;
        let spent: i64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum::<i64>()
            + estimate_tokens(&raw);

        let out: CriticOut = match parse_validated(&raw) {
            Ok(out) => out,
            Err(err) => {
                tracing::warn!(%err, "critic output unparseable");
                return Ok(StageUpdate::new()
                    .with_error(format!("Critic output failed validation: {err}"))
                    .with_trace(NodeTrace::new(
                        StageKind::Critic,
                        StageOutcome::Error,
                        "schema validation failed after repair",
                        0.0,
                    )));
            }
        };

        // Postmortem conclusions are terminal regardless of the verdict
        // the model chose.
        let approved = if postmortem { false } else { out.approved };
        let mut update = StageUpdate {
            what_if_analyses: Some(out.what_if_analyses.clone()),
            critic_approved: Some(Some(approved)),
            critic_feedback: Some(if out.revision_feedback.is_empty() {
                out.overall_assessment.clone()
            } else {
                out.revision_feedback.clone()
            }),
            blocking_issues: Some(out.blocking_issues.clone()),
            residual_risks: Some(out.residual_risks.clone()),
            token_budget_remaining: Some(state.budgets.token_budget_remaining - spent),
            ..Default::default()
        };
        if postmortem {
            update.dark_debt_signal = out.dark_debt_signal.clone();
            // Terminal: the router must not re-enter the supervisor.
            update.error = state.error.clone().or_else(|| {
                Some(format!(
                    "The revision loop stopped after {} iteration(s) without a passing run.",
                    state.iteration_count
                ))
            });
        } else if !approved {
            // Rejection re-enters the supervisor in guard mode.
            update.supervisor_guard = Some(true);
        }

        let outcome = if approved {
            StageOutcome::Success
        } else {
            StageOutcome::NeedsRevision
        };
        Ok(update.with_trace(NodeTrace::new(
            StageKind::Critic,
            outcome,
            out.reasoning,
            out.confidence,
        )))
    }
}
