//! Conditional-edge predicates for the traversal graph.
//!
//! Each `after_*` function is pure: state in, next stage out. The runner
//! wires them into the graph as [`RoutePredicate`](crate::graph::RoutePredicate)s.
//! Back-edges are limited to the three the design permits:
//! sandbox→(curator→worker) on retryable failure, critic→supervisor on
//! rejection, and worker→supervisor on a scope-expansion stop.

use crate::state::RequestState;
use crate::types::{MessageOrigin, PendingSource, StageKind, StopReason, TaskSize};

/// Analyzer placement relative to the sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalyzerMode {
    /// Run the analyzer only after sandbox failures.
    OnFailure,
    /// Run the analyzer between the gate and the sandbox on every pass.
    Always,
}

impl AnalyzerMode {
    /// Parse the configured mode string; unknown values mean on-failure.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "always" => Self::Always,
            _ => Self::OnFailure,
        }
    }
}

/// The routing engine: static flags plus pure edge predicates.
#[derive(Clone, Copy, Debug)]
pub struct Router {
    pub analyzer_enabled: bool,
    pub analyzer_mode: AnalyzerMode,
    pub max_analyzer_calls: u32,
}

impl Router {
    /// Entry point when a pending question is being resumed.
    #[must_use]
    pub fn resume_entry(&self, source: PendingSource) -> StageKind {
        match source {
            // The worker always re-enters through the curator so it gets a
            // fresh pack.
            PendingSource::Worker => StageKind::ContextCurator,
            PendingSource::Planner => StageKind::Planner,
            PendingSource::Supervisor => StageKind::Supervisor,
        }
    }

    /// After the entry classifier.
    #[must_use]
    pub fn after_classifier(&self, state: &RequestState) -> StageKind {
        if state.error.is_some() {
            return StageKind::Respond;
        }
        if state.message_origin == MessageOrigin::UiHelper {
            return StageKind::Respond;
        }
        if state.task_size == TaskSize::Trivial && state.bypass_supervisor {
            return StageKind::ContextCurator;
        }
        StageKind::Supervisor
    }

    /// After the supervisor. In guard mode the supervisor may only clarify
    /// or forward to the worker; downgrading to the planner is forbidden.
    #[must_use]
    pub fn after_supervisor(&self, state: &RequestState) -> StageKind {
        if state.error.is_some() {
            return StageKind::Respond;
        }
        if state.needs_clarification {
            return StageKind::Respond;
        }
        match state.route_to {
            Some(StageKind::Planner) if !state.supervisor_guard => StageKind::Planner,
            Some(StageKind::Planner) => StageKind::ContextCurator,
            Some(StageKind::Respond) => StageKind::Respond,
            // The worker always receives a curated pack first.
            _ => StageKind::ContextCurator,
        }
    }

    /// After the planner.
    #[must_use]
    pub fn after_planner(&self, state: &RequestState) -> StageKind {
        if state.error.is_some() {
            return StageKind::Respond;
        }
        // A plan awaiting user acknowledgement is a pending question.
        if state.needs_input {
            return StageKind::Respond;
        }
        StageKind::ContextCurator
    }

    /// After the context curator: always the worker.
    #[must_use]
    pub fn after_curator(&self, state: &RequestState) -> StageKind {
        if state.error.is_some() {
            return StageKind::Respond;
        }
        StageKind::Worker
    }

    /// After the worker.
    #[must_use]
    pub fn after_worker(&self, state: &RequestState) -> StageKind {
        if let Some(stop) = state.stop_reason {
            return match stop {
                StopReason::NeedsScopeExpansion => StageKind::Supervisor,
                _ => StageKind::Respond,
            };
        }
        if state.needs_input {
            return StageKind::Respond;
        }
        if state.error.is_some() {
            return StageKind::Respond;
        }
        StageKind::IntegrityGate
    }

    /// After the integrity gate. Rejections loop back through the curator
    /// without costing an iteration.
    #[must_use]
    pub fn after_gate(&self, state: &RequestState) -> StageKind {
        if state.error.is_some() {
            return StageKind::Respond;
        }
        match state.integrity_passed {
            Some(true) => {
                if self.analyzer_enabled
                    && self.analyzer_mode == AnalyzerMode::Always
                    && state.budgets.lsp_calls_used < self.max_analyzer_calls
                {
                    StageKind::Analyzer
                } else {
                    StageKind::Sandbox
                }
            }
            _ => StageKind::ContextCurator,
        }
    }

    /// After the analyzer: pre-execution mode continues to the sandbox;
    /// failure-enrichment mode goes back to the worker via the curator.
    #[must_use]
    pub fn after_analyzer(&self, state: &RequestState) -> StageKind {
        if state.error.is_some() {
            return StageKind::Respond;
        }
        match self.analyzer_mode {
            AnalyzerMode::Always => StageKind::Sandbox,
            AnalyzerMode::OnFailure => StageKind::ContextCurator,
        }
    }

    /// After the sandbox.
    #[must_use]
    pub fn after_sandbox(&self, state: &RequestState) -> StageKind {
        if state.error.is_some() {
            return StageKind::Respond;
        }
        match state.execution_exit_code {
            None | Some(0) => StageKind::Critic,
            Some(_) => {
                // The sandbox stage marks postmortem routing (same-failure
                // or exhausted iterations) explicitly.
                if state.route_to == Some(StageKind::Critic) {
                    return StageKind::Critic;
                }
                if state.iteration_count >= state.max_iterations {
                    return StageKind::Critic;
                }
                if self.analyzer_enabled
                    && self.analyzer_mode == AnalyzerMode::OnFailure
                    && state.budgets.lsp_calls_used < self.max_analyzer_calls
                {
                    StageKind::Analyzer
                } else {
                    StageKind::ContextCurator
                }
            }
        }
    }

    /// After the critic. Rejection re-enters the supervisor in guard mode
    /// unless iterations are exhausted.
    #[must_use]
    pub fn after_critic(&self, state: &RequestState) -> StageKind {
        if state.error.is_some() {
            return StageKind::Respond;
        }
        if state.critic_approved.unwrap_or(true) {
            return StageKind::Respond;
        }
        if state.iteration_count >= state.max_iterations {
            return StageKind::Respond;
        }
        StageKind::Supervisor
    }
}

impl Default for Router {
    fn default() -> Self {
        Self {
            analyzer_enabled: true,
            analyzer_mode: AnalyzerMode::OnFailure,
            max_analyzer_calls: 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn state() -> RequestState {
        RequestState::new("run", "user", vec![Message::user("task")])
    }

    fn router() -> Router {
        Router::default()
    }

    #[test]
    fn ui_helper_terminates_at_respond() {
        let mut s = state();
        s.message_origin = MessageOrigin::UiHelper;
        assert_eq!(router().after_classifier(&s), StageKind::Respond);
    }

    #[test]
    fn trivial_bypasses_supervisor() {
        let mut s = state();
        s.task_size = TaskSize::Trivial;
        s.bypass_supervisor = true;
        assert_eq!(router().after_classifier(&s), StageKind::ContextCurator);
        s.bypass_supervisor = false;
        assert_eq!(router().after_classifier(&s), StageKind::Supervisor);
    }

    #[test]
    fn clarification_goes_to_respond() {
        let mut s = state();
        s.needs_clarification = true;
        assert_eq!(router().after_supervisor(&s), StageKind::Respond);
    }

    #[test]
    fn guard_mode_forbids_planner_downgrade() {
        let mut s = state();
        s.route_to = Some(StageKind::Planner);
        assert_eq!(router().after_supervisor(&s), StageKind::Planner);
        s.supervisor_guard = true;
        assert_eq!(router().after_supervisor(&s), StageKind::ContextCurator);
    }

    #[test]
    fn scope_expansion_returns_to_supervisor() {
        let mut s = state();
        s.stop_reason = Some(StopReason::NeedsScopeExpansion);
        assert_eq!(router().after_worker(&s), StageKind::Supervisor);
        s.stop_reason = Some(StopReason::UnsafeRequest);
        assert_eq!(router().after_worker(&s), StageKind::Respond);
        s.stop_reason = None;
        assert_eq!(router().after_worker(&s), StageKind::IntegrityGate);
    }

    #[test]
    fn gate_failure_recurates_without_iteration_cost() {
        let mut s = state();
        s.integrity_passed = Some(false);
        assert_eq!(router().after_gate(&s), StageKind::ContextCurator);
        s.integrity_passed = Some(true);
        assert_eq!(router().after_gate(&s), StageKind::Sandbox);
    }

    #[test]
    fn gate_pass_routes_through_analyzer_in_always_mode() {
        let mut r = router();
        r.analyzer_mode = AnalyzerMode::Always;
        let mut s = state();
        s.integrity_passed = Some(true);
        assert_eq!(r.after_gate(&s), StageKind::Analyzer);
        assert_eq!(r.after_analyzer(&s), StageKind::Sandbox);
    }

    #[test]
    fn sandbox_success_goes_to_critic() {
        let mut s = state();
        s.execution_exit_code = Some(0);
        assert_eq!(router().after_sandbox(&s), StageKind::Critic);
    }

    #[test]
    fn sandbox_failure_enriches_via_analyzer() {
        let mut s = state();
        s.execution_exit_code = Some(1);
        s.iteration_count = 1;
        s.max_iterations = 3;
        assert_eq!(router().after_sandbox(&s), StageKind::Analyzer);
        let mut r = router();
        r.analyzer_enabled = false;
        assert_eq!(r.after_sandbox(&s), StageKind::ContextCurator);
    }

    #[test]
    fn exhausted_iterations_go_postmortem() {
        let mut s = state();
        s.execution_exit_code = Some(1);
        s.iteration_count = 3;
        s.max_iterations = 3;
        assert_eq!(router().after_sandbox(&s), StageKind::Critic);
    }

    #[test]
    fn marked_postmortem_routes_to_critic() {
        let mut s = state();
        s.execution_exit_code = Some(1);
        s.iteration_count = 1;
        s.max_iterations = 3;
        s.route_to = Some(StageKind::Critic);
        assert_eq!(router().after_sandbox(&s), StageKind::Critic);
    }

    #[test]
    fn critic_rejection_reenters_supervisor() {
        let mut s = state();
        s.critic_approved = Some(false);
        s.iteration_count = 1;
        s.max_iterations = 3;
        assert_eq!(router().after_critic(&s), StageKind::Supervisor);
        s.iteration_count = 3;
        assert_eq!(router().after_critic(&s), StageKind::Respond);
        s.critic_approved = Some(true);
        assert_eq!(router().after_critic(&s), StageKind::Respond);
    }

    #[test]
    fn resume_entries_map_sources() {
        let r = router();
        assert_eq!(
            r.resume_entry(PendingSource::Worker),
            StageKind::ContextCurator
        );
        assert_eq!(r.resume_entry(PendingSource::Planner), StageKind::Planner);
        assert_eq!(
            r.resume_entry(PendingSource::Supervisor),
            StageKind::Supervisor
        );
    }
}
