//! Revision-loop controller behavior at the sandbox stage: monotonicity
//! enforcement, declared regressions, iteration accounting, strategy
//! bookkeeping.

mod common;

use common::*;
use synesis::events::StatusBus;
use synesis::graph::{Stage, StageContext};
use synesis::message::Message;
use synesis::state::RequestState;
use synesis::stages::SandboxStage;
use synesis::strategy::{constraints_for, RevisionStrategy};
use synesis::types::{FailureKind, StageKind};

fn ctx() -> StageContext {
    StageContext {
        run_id: "run-1".into(),
        stage: StageKind::Sandbox,
        emitter: StatusBus::disconnected(),
    }
}

fn retry_state() -> RequestState {
    let mut state = RequestState::new("run-1", "user", vec![Message::user("fix the bug")]);
    state.task_description = "fix the bug".into();
    state.target_language = "python".into();
    state.generated_code = "print(1)\n".into();
    state.max_iterations = 3;
    state
}

// A hard-anchored strategy whose preserved stage regresses is a
// strategy violation: iteration does not advance, the strategy is marked
// tried, and the worker is steered back with revert guidance.
#[tokio::test]
async fn monotonicity_regression_is_a_strategy_violation() {
    let sandbox = ScriptedSandbox::new(vec![lint_failure("E501")]);
    let h = harness(ScriptedChat::new(vec![]), sandbox);
    let stage = SandboxStage::new(h.services.clone());

    let mut state = retry_state();
    state.iteration_count = 1;
    state.stages_passed = vec!["lint".into(), "security".into()];
    state.revision_strategy = Some(RevisionStrategy::MinimalFix);
    state.revision_constraints = Some(constraints_for(RevisionStrategy::MinimalFix));

    let update = stage.run(&state, &ctx()).await.unwrap();
    state.apply(update);

    assert!(state.strategy_violation);
    assert_eq!(state.iteration_count, 1);
    assert_eq!(
        state.revision_strategies_tried,
        vec![RevisionStrategy::MinimalFix]
    );
    assert!(state.critic_feedback.contains("Revert"));
}

// The escape hatch: a declared regression with justification is not a
// violation; the iteration advances and the critic gets to judge it.
#[tokio::test]
async fn declared_regression_waives_the_violation() {
    let sandbox = ScriptedSandbox::new(vec![lint_failure("E501")]);
    let h = harness(ScriptedChat::new(vec![]), sandbox);
    let stage = SandboxStage::new(h.services.clone());

    let mut state = retry_state();
    state.iteration_count = 1;
    state.stages_passed = vec!["lint".into()];
    state.revision_strategy = Some(RevisionStrategy::MinimalFix);
    state.revision_constraints = Some(constraints_for(RevisionStrategy::MinimalFix));
    state.regressions_intended = vec!["lint".into()];
    state.regression_justification = Some("splitting the function requires a new import".into());

    let update = stage.run(&state, &ctx()).await.unwrap();
    state.apply(update);

    assert!(!state.strategy_violation);
    assert_eq!(state.iteration_count, 2);
}

// Iteration advances only on a novel fingerprint: the same
// failure a second time routes to postmortem and leaves both the counter
// and the fingerprint list untouched.
#[tokio::test]
async fn repeated_fingerprint_does_not_advance_iteration() {
    let failure = runtime_failure("ZeroDivisionError: division by zero");
    let sandbox = ScriptedSandbox::new(vec![failure.clone(), failure]);
    let h = harness(ScriptedChat::new(vec![]), sandbox);
    let stage = SandboxStage::new(h.services.clone());

    let mut state = retry_state();
    let update = stage.run(&state, &ctx()).await.unwrap();
    state.apply(update);
    assert_eq!(state.iteration_count, 1);
    assert_eq!(state.failure_ids_seen.len(), 1);

    let update = stage.run(&state, &ctx()).await.unwrap();
    state.apply(update);
    assert_eq!(state.iteration_count, 1);
    assert_eq!(state.failure_ids_seen.len(), 1);
    assert_eq!(state.route_to, Some(StageKind::Critic));
}

// Strategy selection excludes tried strategies and records the new pick.
#[tokio::test]
async fn retry_selects_an_untried_strategy() {
    let sandbox = ScriptedSandbox::new(vec![lint_failure("E302")]);
    let h = harness(ScriptedChat::new(vec![]), sandbox);
    let stage = SandboxStage::new(h.services.clone());

    let mut state = retry_state();
    state.revision_strategies_tried = vec![RevisionStrategy::MinimalFix];

    let update = stage.run(&state, &ctx()).await.unwrap();
    state.apply(update);

    assert_eq!(state.failure_kind, Some(FailureKind::Lint));
    assert_eq!(state.revision_strategy, Some(RevisionStrategy::Refactor));
    assert!(state
        .revision_strategies_tried
        .contains(&RevisionStrategy::Refactor));
    assert_eq!(
        state.revision_constraints.as_ref().unwrap().max_loc_delta,
        200
    );
}

// A successful run records the passed stages additively.
#[tokio::test]
async fn success_records_passed_stages() {
    let sandbox = ScriptedSandbox::new(vec![success_result()]);
    let h = harness(ScriptedChat::new(vec![]), sandbox);
    let stage = SandboxStage::new(h.services.clone());

    let mut state = retry_state();
    let update = stage.run(&state, &ctx()).await.unwrap();
    state.apply(update);

    assert_eq!(state.execution_exit_code, Some(0));
    assert!(state.stages_passed.contains(&"lint".to_string()));
    assert!(state.stages_passed.contains(&"security".to_string()));
    assert_eq!(state.iteration_count, 0);
}
