//! Context curator stage: gathers material, then delegates to the pure
//! pack builder.
//!
//! Runs before every worker invocation, including retries. The I/O
//! happens here (fetching organization standards, the base retrieval
//! query, and the targeted re-query on a pivot-plausible retry) so that
//! [`crate::context::build_pack`] stays deterministic.

use async_trait::async_trait;
use tracing::debug;

use super::StageServices;
use crate::context::{
    build_pack, extract_error_excerpt, extract_stderr_entities, promotable_doc_ids, CuratorConfig,
    InjectionAction, PackInputs,
};
use crate::graph::{Stage, StageContext, StageError};
use crate::state::{NodeTrace, RequestState, RetrievedChunk, StageUpdate};
use crate::types::{FailureKind, StageKind, StageOutcome};

pub struct CuratorStage {
    services: StageServices,
}

impl CuratorStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }

    fn config(&self) -> CuratorConfig {
        let settings = &self.services.settings;
        CuratorConfig {
            top_k: settings.rag_top_k,
            retrieval_budget_chars: settings.max_retrieval_chars,
            drift_jaccard_threshold: settings.drift_jaccard_threshold,
            budget_alert_threshold: settings.budget_alert_threshold,
            injection_scan_enabled: settings.injection_scan_enabled,
            injection_action: InjectionAction::parse(&settings.injection_action),
        }
    }

    fn collections(&self, state: &RequestState) -> Vec<String> {
        if state.rag_collections_queried.is_empty() {
            vec!["synesis_catalog".to_string()]
        } else {
            state.rag_collections_queried.clone()
        }
    }

    /// Execution stderr for pivot decisions, flattened from the structured
    /// result.
    fn stderr_of(state: &RequestState) -> String {
        state
            .execution_result
            .as_ref()
            .map(|r| {
                let mut out = String::new();
                if !r.lint.passed {
                    out.push_str(&r.lint.output);
                }
                if !r.security.passed {
                    out.push('\n');
                    out.push_str(&r.security.output);
                }
                out.push('\n');
                out.push_str(&r.execution.output);
                out
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Stage for CuratorStage {
    fn kind(&self) -> StageKind {
        StageKind::ContextCurator
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        ctx.emit("enter", "curating context");
        let settings = &self.services.settings;
        let collections = self.collections(state);

        // Tier 2: organization standards. Failures degrade to an empty
        // tier.
        let mut org_standards = Vec::new();
        if !settings.arch_standards_collections.is_empty() && !state.task_description.is_empty() {
            let query: String = state.task_description.chars().take(300).collect();
            match self
                .services
                .retrieval
                .retrieve(
                    &query,
                    &settings.arch_standards_collections,
                    &state.retrieval_params,
                )
                .await
            {
                Ok(chunks) => {
                    for chunk in chunks.into_iter().take(3) {
                        org_standards.push((chunk.source, chunk.collection, chunk.text));
                    }
                }
                Err(err) => debug!(%err, "org standards fetch skipped"),
            }
        }

        // Tier 3: project manifest from the configured path.
        let mut project_manifest = Vec::new();
        if let Some(path) = &settings.project_manifest_path {
            if let Ok(text) = std::fs::read_to_string(path) {
                project_manifest.push(("project_manifest".to_string(), text));
            }
        }

        // Base retrieval for the task.
        let mut retrieval: Vec<RetrievedChunk> = if state.retrieval_results.is_empty() {
            match self
                .services
                .retrieval
                .retrieve(&state.task_description, &collections, &state.retrieval_params)
                .await
            {
                Ok(chunks) => chunks,
                Err(err) => {
                    debug!(%err, "base retrieval failed, continuing without context");
                    Vec::new()
                }
            }
        } else {
            state.retrieval_results.clone()
        };

        // Knowledge gap: record low-confidence retrievals for indexers.
        if !retrieval.is_empty() && self.services.retrieval.is_low_confidence(&retrieval) {
            self.services
                .backlog
                .record(
                    &state.task_description,
                    crate::clients::RetrievalService::top_score(&retrieval),
                    &collections,
                )
                .await;
        }

        // Retry pivot: re-query with entities extracted from stderr and
        // promote previously excluded chunks that match it. Only for
        // pivot-plausible failures: symbol and dependency errors, not
        // lint whitespace.
        let stderr = Self::stderr_of(state);
        let pivot_plausible = matches!(
            state.failure_kind,
            Some(FailureKind::Lsp) | Some(FailureKind::Runtime)
        );
        if state.iteration_count > 0
            && !stderr.trim().is_empty()
            && settings.curation_mode == "adaptive"
            && settings.recurate_on_retry
            && pivot_plausible
        {
            let entities = extract_stderr_entities(&stderr);
            let query = if entities.is_empty() {
                extract_error_excerpt(&stderr)
            } else {
                entities
                    .iter()
                    .take(5)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            if !query.is_empty() {
                match self
                    .services
                    .retrieval
                    .retrieve(&query, &collections, &state.retrieval_params)
                    .await
                {
                    Ok(entity_chunks) => {
                        ctx.emit("pivot", format!("re-queried with: {query}"));
                        let mut merged = entity_chunks;
                        // Promote prior-excluded chunks whose snippets
                        // match the stderr, then the original results.
                        if let Some(prev) = &state.context_pack {
                            let promoted = promotable_doc_ids(prev, &stderr);
                            let (mut front, back): (Vec<_>, Vec<_>) = retrieval
                                .into_iter()
                                .partition(|c| promoted.contains(&c.source));
                            front.extend(merged.drain(..));
                            front.extend(back);
                            merged = front;
                        } else {
                            merged.extend(retrieval);
                        }
                        // De-dup by (source, text head), first occurrence
                        // wins.
                        let mut seen = std::collections::BTreeSet::new();
                        merged.retain(|c| {
                            let head: String = c.text.chars().take(80).collect();
                            seen.insert((c.source.clone(), head))
                        });
                        retrieval = merged;
                    }
                    Err(err) => debug!(%err, "pivot retrieval failed, reusing prior results"),
                }
            }
        }

        let inputs = PackInputs {
            task_description: state.task_description.clone(),
            target_language: state.target_language.clone(),
            plan: state.plan.clone(),
            iteration: state.iteration_count,
            user_id: state.user_id.clone(),
            org_standards,
            project_manifest,
            retrieval: retrieval.clone(),
            prev_pack: state.context_pack.clone(),
        };
        let pack = build_pack(&inputs, &self.config());
        tracing::info!(
            pinned = pack.pinned.len(),
            retrieved = pack.retrieved.len(),
            excluded = pack.excluded.len(),
            context_hash = %pack.context_hash,
            "context pack produced"
        );

        let rag_context: Vec<String> = pack.retrieved.iter().map(|c| c.text.clone()).collect();
        Ok(StageUpdate {
            context_pack: Some(pack),
            rag_context: Some(rag_context),
            rag_collections_queried: Some(collections),
            retrieval_results: Some(retrieval),
            ..Default::default()
        }
        .with_trace(NodeTrace::new(
            StageKind::ContextCurator,
            StageOutcome::Success,
            "context pack assembled",
            1.0,
        )))
    }
}
