//! Status event bus for traversal progress.
//!
//! Stages emit [`StatusEvent`]s as they enter and leave; the API surface
//! subscribes and translates them into SSE `event: status` frames during
//! streaming responses. The bus is a thin flume fan-in: emitters are cheap
//! to clone and never block the coordinator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::StageKind;

/// A single progress event produced during a traversal.
#[derive(Clone, Debug, Serialize)]
pub struct StatusEvent {
    /// Traversal this event belongs to.
    pub run_id: String,
    /// Stage that produced the event.
    pub stage: StageKind,
    /// Short scope label, e.g. `"enter"`, `"retry"`, `"timeout"`.
    pub scope: String,
    /// Human-readable progress description.
    pub message: String,
    /// Emission time.
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    /// Build an event stamped with the current time.
    pub fn now(
        run_id: impl Into<String>,
        stage: StageKind,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            scope: scope.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Errors that can occur when emitting a status event.
#[derive(Debug, Error)]
pub enum EmitError {
    /// All receivers dropped; the traversal keeps running without status.
    #[error("status bus closed")]
    Closed,
}

/// Abstract emitter handed to stages. Cloneable and non-blocking.
pub trait StatusEmitter: Send + Sync + std::fmt::Debug {
    /// Emit a status event; never blocks the caller.
    fn emit(&self, event: StatusEvent) -> Result<(), EmitError>;
}

/// Fan-in bus backed by an unbounded flume channel.
///
/// One bus is created per traversal when the client asked for streaming;
/// non-streaming requests use [`StatusBus::disconnected`] which drops
/// events on the floor.
#[derive(Debug)]
pub struct StatusBus {
    tx: flume::Sender<StatusEvent>,
    rx: flume::Receiver<StatusEvent>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    /// Create a connected bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// A bus whose receiver is immediately dropped; emits succeed silently
    /// until the sender notices the disconnect.
    #[must_use]
    pub fn disconnected() -> Arc<dyn StatusEmitter> {
        Arc::new(NullEmitter)
    }

    /// Cloneable emitter handle for stages.
    #[must_use]
    pub fn emitter(&self) -> Arc<dyn StatusEmitter> {
        Arc::new(ChannelEmitter {
            tx: self.tx.clone(),
        })
    }

    /// Receiver side for the streaming response writer.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<StatusEvent> {
        self.rx.clone()
    }
}

#[derive(Clone, Debug)]
struct ChannelEmitter {
    tx: flume::Sender<StatusEvent>,
}

impl StatusEmitter for ChannelEmitter {
    fn emit(&self, event: StatusEvent) -> Result<(), EmitError> {
        self.tx.send(event).map_err(|_| EmitError::Closed)
    }
}

#[derive(Clone, Debug)]
struct NullEmitter;

impl StatusEmitter for NullEmitter {
    fn emit(&self, _event: StatusEvent) -> Result<(), EmitError> {
        Ok(())
    }
}

/// User-facing descriptions for progress frames, keyed by stage.
#[must_use]
pub fn stage_status_message(stage: StageKind) -> &'static str {
    match stage {
        StageKind::EntryClassifier => "Classifying your request",
        StageKind::Supervisor => "Analyzing the task",
        StageKind::Planner => "Drafting an execution plan",
        StageKind::ContextCurator => "Curating context",
        StageKind::Worker => "Generating code",
        StageKind::IntegrityGate => "Running integrity checks",
        StageKind::Analyzer => "Running deep static analysis",
        StageKind::Sandbox => "Executing in the sandbox",
        StageKind::Critic => "Reviewing the result",
        StageKind::Respond => "Assembling the response",
        StageKind::End => "Done",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_bus_delivers_events() {
        let bus = StatusBus::new();
        let emitter = bus.emitter();
        let rx = bus.subscribe();

        emitter
            .emit(StatusEvent::now("r1", StageKind::Worker, "enter", "go"))
            .unwrap();

        let ev = rx.recv().unwrap();
        assert_eq!(ev.run_id, "r1");
        assert_eq!(ev.stage, StageKind::Worker);
        assert_eq!(ev.scope, "enter");
    }

    #[test]
    fn null_emitter_swallows_events() {
        let emitter = StatusBus::disconnected();
        assert!(emitter
            .emit(StatusEvent::now("r", StageKind::Critic, "x", "y"))
            .is_ok());
    }
}
