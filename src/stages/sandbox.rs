//! Sandbox stage: isolated execution, failure classification, and the
//! revision-loop bookkeeping.
//!
//! This stage owns the loop-controller state: it advances the iteration
//! counter only on genuinely novel failures, detects monotonicity
//! regressions against the active strategy, fingerprints failures for the
//! same-failure short-circuit, and selects the next revision strategy.
//! Workspace cleanup for the ephemeral path is part of the sandbox
//! service's contract; the warm pool resets itself between runs.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use super::StageServices;
use crate::caches::Outcome;
use crate::clients::language_extension;
use crate::evidence::{make_tool_ref, result_fingerprint, sandbox_result_summary, ToolKind};
use crate::graph::{Stage, StageContext, StageError};
use crate::sandbox::{bundle_patch_ops, classify_failure, has_patch_content};
use crate::state::{NodeTrace, RequestState, StageUpdate};
use crate::strategy::{constraints_for, is_strategy_violation, select_strategy};
use crate::types::{StageKind, StageOutcome};

pub struct SandboxStage {
    services: StageServices,
}

impl SandboxStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Stage for SandboxStage {
    fn kind(&self) -> StageKind {
        StageKind::Sandbox
    }

    fn timeout(&self) -> Option<std::time::Duration> {
        Some(self.services.settings.sandbox_timeout + std::time::Duration::from_secs(15))
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        let settings = &self.services.settings;
        let started = Instant::now();

        // Budget gate: once sandbox minutes are exhausted, nothing else
        // that consumes them may run this traversal.
        if state.budgets.sandbox_minutes_used >= settings.max_sandbox_minutes {
            return Ok(StageUpdate::new()
                .with_error(format!(
                    "Sandbox time limit reached ({} min). A partial result may be available.",
                    settings.max_sandbox_minutes
                ))
                .with_trace(NodeTrace::new(
                    StageKind::Sandbox,
                    StageOutcome::Error,
                    "sandbox budget exhausted",
                    0.0,
                )));
        }

        let has_experiment = state
            .experiment_plan
            .as_ref()
            .is_some_and(|p| !p.commands.is_empty());
        if has_experiment
            && state.budgets.evidence_experiments_count >= settings.max_evidence_experiments
        {
            return Ok(StageUpdate::new()
                .with_error(format!(
                    "Evidence experiment budget reached ({} experiments).",
                    settings.max_evidence_experiments
                ))
                .with_trace(NodeTrace::new(
                    StageKind::Sandbox,
                    StageOutcome::Error,
                    "experiment budget exhausted",
                    0.0,
                )));
        }

        let attempt_id = {
            let run_head: String = state.run_id.chars().take(8).collect();
            format!("{run_head}-{}", state.iteration_count)
        };

        // Patch-ops-only submissions get bundled into a runnable script.
        let mut code = state.generated_code.clone();
        let mut language = state.target_language.clone();
        if code.trim().is_empty() && has_patch_content(&state.patch_ops) {
            code = bundle_patch_ops(
                &state.patch_ops,
                &language,
                state.experiment_plan.as_ref(),
                &attempt_id,
            );
            language = "bash".into();
        }
        if code.trim().is_empty() {
            return Ok(StageUpdate {
                execution_exit_code: Some(Some(0)),
                execution_lint_passed: Some(true),
                execution_security_passed: Some(true),
                attempt_id: Some(attempt_id),
                ..Default::default()
            }
            .with_trace(NodeTrace::new(
                StageKind::Sandbox,
                StageOutcome::Success,
                "no code to execute",
                1.0,
            )));
        }

        ctx.emit("enter", "executing in the sandbox");
        let request_id = Uuid::new_v4().to_string();
        let filename = format!("script.{}", language_extension(&language));
        let result = match self
            .services
            .sandbox
            .execute(&language, &code, &filename, &request_id)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(%err, "sandbox execution failed");
                return Ok(StageUpdate {
                    sandbox_minutes_used: Some(
                        state.budgets.sandbox_minutes_used
                            + started.elapsed().as_secs_f64() / 60.0,
                    ),
                    ..Default::default()
                }
                .with_error(format!("Sandbox execution failed: {err}"))
                .with_trace(NodeTrace::new(
                    StageKind::Sandbox,
                    StageOutcome::Error,
                    format!("sandbox error: {err}"),
                    0.0,
                )));
            }
        };

        let code_head: String = code.chars().take(2000).collect();
        let params = json!({
            "code": code_head,
            "language": language,
            "context_files": state.files_touched.iter().take(20).collect::<Vec<_>>(),
        });
        let result_value = serde_json::to_value(&result).unwrap_or_default();
        let tool_ref = make_tool_ref(
            ToolKind::Sandbox,
            &params,
            &result_value,
            Some(request_id),
            sandbox_result_summary(&result),
            "",
        );

        let exit_code = result.exit_code;
        let lint_passed = result.lint.passed;
        let security_passed = result.security.passed;
        let elapsed_minutes = started.elapsed().as_secs_f64() / 60.0;

        let mut update = StageUpdate {
            execution_result: Some(result.clone()),
            execution_exit_code: Some(Some(exit_code)),
            execution_lint_passed: Some(lint_passed),
            execution_security_passed: Some(security_passed),
            attempt_id: Some(attempt_id),
            sandbox_minutes_used: Some(state.budgets.sandbox_minutes_used + elapsed_minutes),
            evidence_experiments_count: has_experiment
                .then(|| state.budgets.evidence_experiments_count + 1),
            tool_refs: vec![tool_ref],
            ..Default::default()
        };

        if exit_code == 0 {
            for stage in ["lint", "security"] {
                update.stages_passed.push(stage.to_string());
            }
            self.services.failfast.put(
                &state.task_description,
                &state.target_language,
                Outcome::Success,
                &code,
                "",
            );
            tracing::info!(exit_code, "sandbox run succeeded");
            return Ok(update.with_trace(
                NodeTrace::new(
                    StageKind::Sandbox,
                    StageOutcome::Success,
                    "exit_code=0, lint=pass, security=pass",
                    1.0,
                )
                .with_latency_ms(started.elapsed().as_secs_f64() * 1000.0),
            ));
        }

        // Failure path.
        let failure_kind = classify_failure(&result, !state.lsp_diagnostics.is_empty());
        let fingerprint = result_fingerprint(&result);
        let same_failure = state.failure_ids_seen.contains(&fingerprint);
        update.failure_kind = Some(Some(failure_kind));

        let mut error_summary = String::new();
        if !lint_passed {
            let head: String = result.lint.output.chars().take(256).collect();
            error_summary.push_str(&format!("Lint: {head}. "));
        }
        if !security_passed {
            error_summary.push_str("Security issues found. ");
        }
        if !result.execution.output.is_empty() {
            let head: String = result.execution.output.chars().take(256).collect();
            error_summary.push_str(&format!("Runtime: {head}"));
        }
        self.services.failfast.put(
            &state.task_description,
            &state.target_language,
            Outcome::Failure,
            &code,
            &error_summary,
        );
        // Long-term knowledge base write, off the critical path.
        {
            let store = self.services.failure_store.clone();
            let result = result.clone();
            let task = state.task_description.clone();
            let lang = state.target_language.clone();
            tokio::spawn(async move {
                store.store_failure(&code, &result, &task, &lang).await;
            });
        }

        if same_failure {
            // Same-failure short-circuit: the fingerprint is already
            // recorded, retrying would burn budget on a known dead end.
            tracing::warn!(%fingerprint, "repeated failure, routing to postmortem");
            ctx.emit("postmortem", "same failure repeated");
            update.route_to = Some(StageKind::Critic);
            return Ok(update.with_trace(
                NodeTrace::new(
                    StageKind::Sandbox,
                    StageOutcome::NeedsRevision,
                    format!("repeated failure {fingerprint}"),
                    0.3,
                )
                .with_latency_ms(started.elapsed().as_secs_f64() * 1000.0),
            ));
        }
        update.failure_ids_seen.push(fingerprint.clone());

        // Monotonicity: a preserved, previously-passed stage failing now
        // is a strategy violation, not a fresh iteration.
        let failed_stage = if !lint_passed {
            Some("lint")
        } else if !security_passed {
            Some("security")
        } else {
            None
        };
        let violation = match (failed_stage, &state.revision_constraints) {
            (Some(stage), Some(constraints)) => is_strategy_violation(
                constraints,
                &state.stages_passed,
                stage,
                &state.regressions_intended,
            ),
            _ => false,
        };

        // Record what did pass this attempt; passes are additive.
        if lint_passed {
            update.stages_passed.push("lint".into());
        }
        if security_passed {
            update.stages_passed.push("security".into());
        }

        if violation {
            let tried = state.revision_strategy.into_iter().collect::<Vec<_>>();
            update.revision_strategies_tried = tried;
            update.strategy_violation = Some(true);
            update.critic_feedback = Some(
                "A previously passed stage regressed. Revert the regression and retry within \
                 the same strategy, or declare regressions_intended with a justification."
                    .into(),
            );
            tracing::warn!(failed = ?failed_stage, "monotonicity regression detected");
            return Ok(update.with_trace(
                NodeTrace::new(
                    StageKind::Sandbox,
                    StageOutcome::NeedsRevision,
                    "strategy violation: preserved stage regressed",
                    0.3,
                )
                .with_latency_ms(started.elapsed().as_secs_f64() * 1000.0),
            ));
        }

        update.strategy_violation = Some(false);
        let next_iteration = state.iteration_count + 1;
        update.iteration_count = Some(next_iteration);

        if next_iteration < state.max_iterations {
            let strategy = select_strategy(
                Some(failure_kind),
                &state.revision_strategies_tried,
                state.iteration_count,
                state.max_iterations,
            );
            update.revision_strategy = Some(Some(strategy));
            update.revision_constraints = Some(Some(constraints_for(strategy)));
            update.revision_strategies_tried = vec![strategy];
            ctx.emit(
                "retry",
                format!("failure={failure_kind} strategy={strategy}"),
            );
        } else {
            // Out of iterations: the router sends this to the critic in
            // postmortem mode.
            ctx.emit("postmortem", "iteration budget exhausted");
        }

        Ok(update.with_trace(
            NodeTrace::new(
                StageKind::Sandbox,
                StageOutcome::NeedsRevision,
                format!(
                    "exit_code={exit_code}, lint={}, security={}",
                    if lint_passed { "pass" } else { "fail" },
                    if security_passed { "pass" } else { "fail" },
                ),
                0.3,
            )
            .with_latency_ms(started.elapsed().as_secs_f64() * 1000.0),
        ))
    }
}
