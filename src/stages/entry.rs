//! Entry classifier stage: the deterministic pre-pass.
//!
//! Produces the intent envelope from the scoring engine and overrides.
//! Pure (no I/O) and infallible: a request is never failed by
//! classification.

use async_trait::async_trait;

use super::StageServices;
use crate::graph::{Stage, StageContext, StageError};
use crate::state::{NodeTrace, RequestState, StageUpdate};
use crate::types::{MessageOrigin, StageKind, StageOutcome, TaskSize};

pub struct EntryClassifierStage {
    services: StageServices,
}

impl EntryClassifierStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Stage for EntryClassifierStage {
    fn kind(&self) -> StageKind {
        StageKind::EntryClassifier
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        let content = state.last_user_content().unwrap_or_default().to_string();
        let envelope = self.services.classifier.classify(&content);
        ctx.emit(
            "classified",
            format!(
                "size={} lang={} score={}",
                envelope.task_size, envelope.target_language, envelope.score
            ),
        );
        tracing::info!(
            task_size = %envelope.task_size,
            language = %envelope.target_language,
            score = envelope.score,
            origin = ?envelope.message_origin,
            "entry classified"
        );

        let mut update = StageUpdate {
            task_size: Some(envelope.task_size),
            target_language: Some(envelope.target_language.clone()),
            interaction_mode: Some(envelope.interaction_mode),
            message_origin: Some(envelope.message_origin),
            worker_prompt_tier: Some(envelope.worker_prompt_tier),
            bypass_supervisor: Some(envelope.bypass_supervisor),
            bypass_planner: Some(envelope.bypass_planner),
            plan_required: Some(envelope.plan_required),
            clarification_budget: Some(envelope.clarification_budget),
            active_domain_refs: Some(envelope.active_domain_refs.clone()),
            token_budget_remaining: Some(self.services.settings.token_budget),
            max_iterations: Some(self.services.settings.max_iterations),
            target_workspace: Some(self.services.settings.target_workspace.clone()),
            ..Default::default()
        };

        if envelope.message_origin == MessageOrigin::UiHelper {
            update.error = Some("UI helper request; no coding task".into());
        }

        // Trivial fast path: seed what the supervisor and planner would
        // otherwise produce.
        if envelope.task_size == TaskSize::Trivial && envelope.bypass_supervisor {
            update.task_description = envelope.task_description.clone();
            update.touched_files = Some(envelope.touched_files.clone());
            update.defaults_used = Some(envelope.defaults_used.clone());
            update.allowed_tools = Some(envelope.allowed_tools.clone());
        } else if !content.is_empty() {
            update.task_description = Some(content);
        }

        let reasoning = format!(
            "score={} hits=[{}]",
            envelope.score,
            envelope.classification_hits.join(", ")
        );
        Ok(update.with_trace(NodeTrace::new(
            StageKind::EntryClassifier,
            StageOutcome::Success,
            reasoning,
            1.0,
        )))
    }
}
