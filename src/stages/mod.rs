//! Stage implementations for the traversal graph.
//!
//! Each stage exposes the same narrow interface, [`Stage::run`] over the
//! shared state, and owns exactly one responsibility. Pure stages
//! (classifier, gate) never perform I/O; model-backed stages go through
//! [`StageServices`] so tests can substitute deterministic stubs.

mod analyzer;
mod critic;
mod curator;
mod entry;
mod gate;
mod planner;
mod respond;
mod sandbox;
mod supervisor;
mod worker;

pub use analyzer::AnalyzerStage;
pub use critic::CriticStage;
pub use curator::CuratorStage;
pub use entry::EntryClassifierStage;
pub use gate::GateStage;
pub use planner::PlannerStage;
pub use respond::RespondStage;
pub use sandbox::SandboxStage;
pub use supervisor::SupervisorStage;
pub use worker::WorkerStage;

use std::sync::Arc;

use crate::breaker::BreakerRegistry;
use crate::caches::{FailFastCache, FailureStore, KnowledgeBacklog};
use crate::classifier::IntentClassifier;
use crate::clients::{AnalysisClient, ChatModel, RetrievalService, SandboxExecutor};
use crate::config::{DefaultsPolicy, Settings};
use crate::graph::{GraphBuilder, GraphError, StageGraph};
use crate::memory::ConversationMemory;
use crate::routing::Router;
use crate::state::RequestState;
use crate::types::StageKind;

/// Shared handles every model-backed stage draws from.
#[derive(Clone)]
pub struct StageServices {
    pub settings: Arc<Settings>,
    pub policy: DefaultsPolicy,
    pub chat: Arc<dyn ChatModel>,
    pub retrieval: Arc<RetrievalService>,
    pub sandbox: Arc<SandboxExecutor>,
    pub analysis: Arc<dyn AnalysisClient>,
    pub failfast: Arc<FailFastCache>,
    pub failure_store: Arc<FailureStore>,
    pub backlog: Arc<KnowledgeBacklog>,
    pub memory: Arc<ConversationMemory>,
    pub breakers: Arc<BreakerRegistry>,
    pub classifier: Arc<IntentClassifier>,
}

/// Rough token estimate used for budget accounting (≈4 chars/token).
#[must_use]
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() / 4) as i64
}

/// Chat completion guarded by the model endpoint's circuit breaker. An
/// open breaker short-circuits without touching the endpoint.
pub(crate) async fn guarded_complete(
    services: &StageServices,
    messages: &[crate::message::Message],
    request_id: &str,
) -> Result<String, crate::graph::StageError> {
    let breaker = services.breakers.breaker("model:chat");
    if !breaker.allow_request() {
        return Err(crate::clients::ClientError::BreakerOpen {
            service: "chat-model",
        }
        .into());
    }
    match services.chat.complete(messages, request_id).await {
        Ok(text) => {
            breaker.record_success();
            Ok(text)
        }
        Err(err) => {
            breaker.record_failure();
            Err(err.into())
        }
    }
}

/// Whether the token budget still admits a model call.
#[must_use]
pub fn token_budget_exhausted(state: &RequestState) -> bool {
    state.budgets.token_budget_remaining <= 0
}

/// Assemble the full traversal graph with its conditional edges.
pub fn build_graph(services: StageServices, router: Router) -> Result<StageGraph, GraphError> {
    GraphBuilder::new()
        .add_stage(EntryClassifierStage::new(services.clone()))
        .add_stage(SupervisorStage::new(services.clone()))
        .add_stage(PlannerStage::new(services.clone()))
        .add_stage(CuratorStage::new(services.clone()))
        .add_stage(WorkerStage::new(services.clone()))
        .add_stage(GateStage::new(services.clone()))
        .add_stage(AnalyzerStage::new(services.clone()))
        .add_stage(SandboxStage::new(services.clone()))
        .add_stage(CriticStage::new(services.clone()))
        .add_stage(RespondStage::new(services))
        .add_route(
            StageKind::EntryClassifier,
            Arc::new(move |s| router.after_classifier(s)),
        )
        .add_route(
            StageKind::Supervisor,
            Arc::new(move |s| router.after_supervisor(s)),
        )
        .add_route(
            StageKind::Planner,
            Arc::new(move |s| router.after_planner(s)),
        )
        .add_route(
            StageKind::ContextCurator,
            Arc::new(move |s| router.after_curator(s)),
        )
        .add_route(StageKind::Worker, Arc::new(move |s| router.after_worker(s)))
        .add_route(
            StageKind::IntegrityGate,
            Arc::new(move |s| router.after_gate(s)),
        )
        .add_route(
            StageKind::Analyzer,
            Arc::new(move |s| router.after_analyzer(s)),
        )
        .add_route(
            StageKind::Sandbox,
            Arc::new(move |s| router.after_sandbox(s)),
        )
        .add_route(StageKind::Critic, Arc::new(move |s| router.after_critic(s)))
        .add_edge(StageKind::Respond, StageKind::End)
        .with_entry(StageKind::EntryClassifier)
        .compile()
}
