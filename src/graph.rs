//! The stage graph: execution interface and conditional-edge topology.
//!
//! A stage is an async unit of work over the request state; it returns a
//! [`StageUpdate`] the runner merges. Routing is data, not polymorphism: a
//! [`RoutePredicate`] is a pure function from state to the next stage, and
//! the graph is a value constructed once at process start.
//!
//! ```
//! use std::sync::Arc;
//! use synesis::graph::{GraphBuilder, RoutePredicate, Stage, StageContext, StageError};
//! use synesis::state::{RequestState, StageUpdate};
//! use synesis::types::StageKind;
//! use async_trait::async_trait;
//!
//! struct Respond;
//!
//! #[async_trait]
//! impl Stage for Respond {
//!     fn kind(&self) -> StageKind { StageKind::Respond }
//!     async fn run(&self, _state: &RequestState, _ctx: &StageContext)
//!         -> Result<StageUpdate, StageError>
//!     {
//!         Ok(StageUpdate::default())
//!     }
//! }
//!
//! let route: RoutePredicate = Arc::new(|_state| StageKind::End);
//! let graph = GraphBuilder::new()
//!     .add_stage(Respond)
//!     .add_route(StageKind::Respond, route)
//!     .with_entry(StageKind::Respond)
//!     .compile()
//!     .unwrap();
//! assert_eq!(graph.entry(), StageKind::Respond);
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::clients::ClientError;
use crate::events::{StatusEmitter, StatusEvent};
use crate::schemas::SchemaError;
use crate::state::{RequestState, StageUpdate};
use crate::types::StageKind;

/// Execution context handed to stages: identity plus the status emitter.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: String,
    pub stage: StageKind,
    pub emitter: Arc<dyn StatusEmitter>,
}

impl StageContext {
    /// Emit a progress event scoped to this stage. Emission failures are
    /// swallowed; status is advisory.
    pub fn emit(&self, scope: impl Into<String>, message: impl Into<String>) {
        let _ = self.emitter.emit(StatusEvent::now(
            self.run_id.clone(),
            self.stage,
            scope,
            message,
        ));
    }
}

/// Fatal errors a stage can raise. Recoverable conditions go into the
/// state (`error`, `stop_reason`, traces) instead.
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    /// A prior stage did not produce data this stage requires.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(synesis::stage::missing_input),
        help("Check that the previous stage produced the required data: {what}.")
    )]
    MissingInput { what: &'static str },

    /// An external service failed.
    #[error(transparent)]
    #[diagnostic(code(synesis::stage::client))]
    Client(#[from] ClientError),

    /// Model output failed validation after the repair pass.
    #[error(transparent)]
    #[diagnostic(code(synesis::stage::schema))]
    Schema(#[from] SchemaError),

    /// Anything else.
    #[error("stage failed: {0}")]
    #[diagnostic(code(synesis::stage::internal))]
    Internal(String),
}

/// An executable stage.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The stage's identity in the graph.
    fn kind(&self) -> StageKind;

    /// Per-stage deadline; `None` uses the runner default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute against a state snapshot and return the partial update.
    async fn run(&self, state: &RequestState, ctx: &StageContext)
        -> Result<StageUpdate, StageError>;
}

/// Pure routing function evaluated after a stage completes.
pub type RoutePredicate = Arc<dyn Fn(&RequestState) -> StageKind + Send + Sync>;

/// Errors from graph assembly.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("no entry stage configured")]
    #[diagnostic(code(synesis::graph::missing_entry))]
    MissingEntry,

    #[error("entry stage {0} is not registered")]
    #[diagnostic(code(synesis::graph::entry_not_registered))]
    EntryNotRegistered(StageKind),

    #[error("route declared for unregistered stage {0}")]
    #[diagnostic(code(synesis::graph::route_without_stage))]
    RouteWithoutStage(StageKind),

    #[error("stage {0} has no outgoing route")]
    #[diagnostic(
        code(synesis::graph::dead_end),
        help("Every registered stage needs a route; terminal stages route to End.")
    )]
    DeadEnd(StageKind),
}

/// The compiled traversal graph.
pub struct StageGraph {
    stages: FxHashMap<StageKind, Arc<dyn Stage>>,
    routes: FxHashMap<StageKind, RoutePredicate>,
    entry: StageKind,
}

impl std::fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageGraph")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .finish()
    }
}

impl StageGraph {
    /// The configured entry stage.
    #[must_use]
    pub fn entry(&self) -> StageKind {
        self.entry
    }

    /// Look up a stage implementation.
    #[must_use]
    pub fn stage(&self, kind: StageKind) -> Option<&Arc<dyn Stage>> {
        self.stages.get(&kind)
    }

    /// Evaluate the conditional edge leaving `kind`. Unrouted stages fall
    /// through to `End`.
    #[must_use]
    pub fn next_stage(&self, kind: StageKind, state: &RequestState) -> StageKind {
        self.routes
            .get(&kind)
            .map(|route| route(state))
            .unwrap_or(StageKind::End)
    }

    /// Number of registered stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

/// Fluent builder for the stage graph.
#[derive(Default)]
pub struct GraphBuilder {
    stages: FxHashMap<StageKind, Arc<dyn Stage>>,
    routes: FxHashMap<StageKind, RoutePredicate>,
    entry: Option<StageKind>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage under its own [`Stage::kind`].
    #[must_use]
    pub fn add_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.insert(stage.kind(), Arc::new(stage));
        self
    }

    /// Register a shared stage instance.
    #[must_use]
    pub fn add_shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.kind(), stage);
        self
    }

    /// Attach the conditional edge leaving `from`.
    #[must_use]
    pub fn add_route(mut self, from: StageKind, predicate: RoutePredicate) -> Self {
        self.routes.insert(from, predicate);
        self
    }

    /// Attach an unconditional edge leaving `from`.
    #[must_use]
    pub fn add_edge(mut self, from: StageKind, to: StageKind) -> Self {
        self.routes.insert(from, Arc::new(move |_| to));
        self
    }

    /// Declare the entry stage.
    #[must_use]
    pub fn with_entry(mut self, entry: StageKind) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Validate and produce the graph.
    pub fn compile(self) -> Result<StageGraph, GraphError> {
        let entry = self.entry.ok_or(GraphError::MissingEntry)?;
        if !self.stages.contains_key(&entry) {
            return Err(GraphError::EntryNotRegistered(entry));
        }
        for from in self.routes.keys() {
            if !self.stages.contains_key(from) {
                return Err(GraphError::RouteWithoutStage(*from));
            }
        }
        for kind in self.stages.keys() {
            if !self.routes.contains_key(kind) {
                return Err(GraphError::DeadEnd(*kind));
            }
        }
        Ok(StageGraph {
            stages: self.stages,
            routes: self.routes,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(StageKind);

    #[async_trait]
    impl Stage for Noop {
        fn kind(&self) -> StageKind {
            self.0
        }
        async fn run(
            &self,
            _state: &RequestState,
            _ctx: &StageContext,
        ) -> Result<StageUpdate, StageError> {
            Ok(StageUpdate::default())
        }
    }

    #[test]
    fn compile_requires_entry() {
        let err = GraphBuilder::new().compile().unwrap_err();
        assert!(matches!(err, GraphError::MissingEntry));
    }

    #[test]
    fn compile_rejects_dead_ends() {
        let err = GraphBuilder::new()
            .add_stage(Noop(StageKind::Respond))
            .with_entry(StageKind::Respond)
            .compile()
            .unwrap_err();
        assert!(matches!(err, GraphError::DeadEnd(StageKind::Respond)));
    }

    #[test]
    fn conditional_edge_evaluates_state() {
        let route: RoutePredicate = Arc::new(|state| {
            if state.error.is_some() {
                StageKind::End
            } else {
                StageKind::Respond
            }
        });
        let graph = GraphBuilder::new()
            .add_stage(Noop(StageKind::Respond))
            .add_route(StageKind::Respond, route)
            .with_entry(StageKind::Respond)
            .compile()
            .unwrap();

        let mut state = RequestState::new("r", "u", vec![]);
        assert_eq!(
            graph.next_stage(StageKind::Respond, &state),
            StageKind::Respond
        );
        state.error = Some("boom".into());
        assert_eq!(graph.next_stage(StageKind::Respond, &state), StageKind::End);
    }

    #[test]
    fn unrouted_stage_falls_through_to_end() {
        let graph = GraphBuilder::new()
            .add_stage(Noop(StageKind::Respond))
            .add_edge(StageKind::Respond, StageKind::End)
            .with_entry(StageKind::Respond)
            .compile()
            .unwrap();
        let state = RequestState::new("r", "u", vec![]);
        assert_eq!(graph.next_stage(StageKind::Critic, &state), StageKind::End);
    }
}
