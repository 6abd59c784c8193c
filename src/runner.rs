//! The coordinator: one traversal of the stage graph per request.
//!
//! Each request gets a single logical coordinator that walks the graph
//! sequentially with respect to its own state: run the current stage
//! under its deadline, merge the update, evaluate the conditional edge,
//! move on. Exceeding a deadline appends a `TIMEOUT` trace and falls
//! through to the respond stage; so does any stage error. A step ceiling
//! backstops routing bugs; bounded loops are expected, unbounded ones
//! are not.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::classifier::detect_language;
use crate::config::Settings;
use crate::events::{stage_status_message, StatusEmitter, StatusEvent};
use crate::graph::{StageContext, StageGraph};
use crate::memory::ConversationMemory;
use crate::message::Message;
use crate::routing::Router;
use crate::state::{NodeTrace, RequestState};
use crate::types::{StageKind, StageOutcome};

/// Safety ceiling on stage executions per traversal. Generous: the worst
/// legitimate case is max_iterations revision cycles of a handful of
/// stages each.
const MAX_STEPS: usize = 64;

/// Outcome of one traversal.
#[derive(Debug)]
pub struct TraversalReport {
    pub state: RequestState,
    pub steps: usize,
    pub elapsed: Duration,
}

/// Drives request traversals over a compiled graph.
pub struct Coordinator {
    graph: Arc<StageGraph>,
    router: Router,
    memory: Arc<ConversationMemory>,
    settings: Arc<Settings>,
}

impl Coordinator {
    /// Build a coordinator over the shared graph.
    #[must_use]
    pub fn new(
        graph: Arc<StageGraph>,
        router: Router,
        memory: Arc<ConversationMemory>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            graph,
            router,
            memory,
            settings,
        }
    }

    /// Execute one traversal to completion. Always returns a state whose
    /// last message is user-addressable.
    pub async fn run(
        &self,
        mut state: RequestState,
        emitter: Arc<dyn StatusEmitter>,
    ) -> TraversalReport {
        let started = Instant::now();

        // Era pivot: a language switch archives and flushes the prior
        // history so it cannot contaminate the new traversal. The summary
        // is deterministic here; a model-backed summarizer can be hung off
        // the archive sink.
        if let Some(content) = state.last_user_content() {
            let language = detect_language(content);
            if self.memory.note_language(&state.user_id, &language) {
                let note = self.memory.flush_on_pivot(
                    &state.user_id,
                    &format!("work in a different language than {language}"),
                );
                if !note.is_empty() {
                    state.conversation_history.push(note);
                }
            }
        }

        // Entry: resume at the parked stage when a pending question is
        // being answered, otherwise start at the classifier.
        let mut current = match self.memory.take_pending(&state.user_id) {
            Some(pending) => {
                info!(source = ?pending.source, "resuming from pending question");
                state.resume_from = Some(pending.source);
                self.rehydrate(&mut state, &pending.context);
                self.router.resume_entry(pending.source)
            }
            None => self.graph.entry(),
        };

        let mut steps = 0usize;
        let mut respond_forced = false;
        while current != StageKind::End {
            let Some(stage) = self.graph.stage(current) else {
                error!(stage = %current, "stage not registered; terminating traversal");
                state.error = Some(format!("internal routing error at {current}"));
                break;
            };

            steps += 1;
            if steps > MAX_STEPS && !respond_forced {
                warn!(steps, "step ceiling reached, forcing respond");
                state.error = Some("traversal exceeded the step ceiling".into());
                respond_forced = true;
                current = StageKind::Respond;
                continue;
            }

            let ctx = StageContext {
                run_id: state.run_id.clone(),
                stage: current,
                emitter: emitter.clone(),
            };
            let _ = emitter.emit(StatusEvent::now(
                state.run_id.clone(),
                current,
                "status",
                stage_status_message(current),
            ));

            let deadline = stage.timeout().unwrap_or(self.settings.node_timeout);
            let stage_started = Instant::now();
            match tokio::time::timeout(deadline, stage.run(&state, &ctx)).await {
                Ok(Ok(mut update)) => {
                    for trace in &mut update.node_traces {
                        if trace.latency_ms == 0.0 {
                            trace.latency_ms = stage_started.elapsed().as_secs_f64() * 1000.0;
                        }
                    }
                    state.apply(update);
                }
                Ok(Err(err)) => {
                    error!(stage = %current, %err, "stage failed");
                    state.node_traces.push(NodeTrace::new(
                        current,
                        StageOutcome::Error,
                        format!("stage failed: {err}"),
                        0.0,
                    ));
                    if state.error.is_none() {
                        state.error = Some(format!("{current} failed: {err}"));
                    }
                    if current == StageKind::Respond {
                        break;
                    }
                    current = StageKind::Respond;
                    continue;
                }
                Err(_) => {
                    error!(stage = %current, ?deadline, "stage timed out");
                    state.node_traces.push(
                        NodeTrace::new(
                            current,
                            StageOutcome::Timeout,
                            format!("timeout after {deadline:?}"),
                            0.0,
                        )
                        .with_latency_ms(deadline.as_secs_f64() * 1000.0),
                    );
                    if state.error.is_none() {
                        state.error = Some(format!("{current} timed out"));
                    }
                    if current == StageKind::Respond {
                        break;
                    }
                    current = StageKind::Respond;
                    continue;
                }
            }

            current = if current == StageKind::Respond {
                StageKind::End
            } else {
                self.graph.next_stage(current, &state)
            };
        }

        // The respond stage always appends the final message; if the
        // traversal broke before it ran, synthesize one so the caller
        // never sees an empty reply.
        let has_reply = state.messages.last().is_some_and(Message::is_reply);
        if !has_reply {
            let reason = state
                .error
                .clone()
                .unwrap_or_else(|| "the traversal produced no output".into());
            state.messages.push(Message::reply(
                StageKind::Respond,
                format!("I encountered an issue while processing your request: {reason}"),
            ));
        }

        info!(
            steps,
            iterations = state.iteration_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "traversal complete"
        );
        TraversalReport {
            state,
            steps,
            elapsed: started.elapsed(),
        }
    }

    /// Restore the minimum stage inputs a resumed traversal needs. The
    /// classifier is skipped on resume, so its outputs come from the
    /// parked context and settings defaults.
    fn rehydrate(&self, state: &mut RequestState, context: &serde_json::Value) {
        if let Some(desc) = context["task_description"].as_str() {
            if state.task_description.is_empty() {
                state.task_description = desc.to_string();
            }
        }
        if let Some(lang) = context["target_language"].as_str() {
            if state.target_language.is_empty() {
                state.target_language = lang.to_string();
            }
        }
        if let Some(files) = context["touched_files"].as_array() {
            if state.touched_files.is_empty() {
                state.touched_files = files
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
        }
        state.max_iterations = self.settings.max_iterations;
        state.budgets.token_budget_remaining = self.settings.token_budget;
        state.target_workspace = self.settings.target_workspace.clone();
    }
}
