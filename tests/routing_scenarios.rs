//! End-to-end routing scenarios driven through the full coordinator with
//! scripted model and sandbox stubs.

mod common;

use std::sync::Arc;

use common::*;
use synesis::events::StatusBus;
use synesis::message::Message;
use synesis::routing::{AnalyzerMode, Router};
use synesis::runner::Coordinator;
use synesis::stages::build_graph;
use synesis::state::RequestState;
use synesis::types::{StageKind, StageOutcome, TaskSize};

fn coordinator(harness: &TestHarness, router: Router) -> Coordinator {
    let graph = Arc::new(build_graph(harness.services.clone(), router).unwrap());
    Coordinator::new(
        graph,
        router,
        harness.memory.clone(),
        harness.settings.clone(),
    )
}

fn no_analyzer() -> Router {
    Router {
        analyzer_enabled: false,
        analyzer_mode: AnalyzerMode::OnFailure,
        max_analyzer_calls: 6,
    }
}

fn request(user_id: &str, content: &str) -> RequestState {
    RequestState::new(
        uuid::Uuid::new_v4().to_string(),
        user_id,
        vec![Message::user(content)],
    )
}

const WORKER_HELLO: &str = r#"{
    "code": "print(\"Hello, world!\")",
    "explanation": "Prints a greeting.",
    "reasoning": "one-liner",
    "confidence": 0.95,
    "files_touched": ["hello.py"]
}"#;

const CRITIC_APPROVE: &str = r#"{
    "approved": true,
    "overall_assessment": "Straightforward and safe.",
    "confidence": 0.9,
    "reasoning": "no risks",
    "what_if_analyses": [
        {"scenario": "stdout redirected", "risk_level": "low", "explanation": "harmless"}
    ]
}"#;

// A trivial Python hello-world takes the fast path: classifier, curator,
// worker, gate, sandbox, critic, respond. No supervisor call, iteration stays 0.
#[tokio::test]
async fn trivial_hello_world_skips_supervisor() {
    let chat = ScriptedChat::new(vec![WORKER_HELLO, CRITIC_APPROVE]);
    let sandbox = ScriptedSandbox::new(vec![success_result()]);
    let h = harness(chat.clone(), sandbox.clone());
    let report = coordinator(&h, no_analyzer())
        .run(
            request("alice", "hello world in python"),
            StatusBus::disconnected(),
        )
        .await;

    let state = report.state;
    assert_eq!(state.task_size, TaskSize::Trivial);
    assert_eq!(state.target_language, "python");
    assert!(state.bypass_supervisor);
    assert_eq!(state.iteration_count, 0);
    // Worker and critic only; the supervisor never ran.
    assert_eq!(chat.call_count(), 2);
    assert!(!state
        .node_traces
        .iter()
        .any(|t| t.stage == StageKind::Supervisor));
    assert_eq!(sandbox.execution_count(), 1);

    let reply = state.messages.last().unwrap();
    assert!(reply.is_reply());
    assert!(reply.content.contains("print(\"Hello, world!\")"));
}

// A UI-helper prompt terminates at respond without any model calls.
#[tokio::test]
async fn ui_helper_is_rejected_without_model_calls() {
    let chat = ScriptedChat::new(vec![]);
    let sandbox = ScriptedSandbox::new(vec![]);
    let h = harness(chat.clone(), sandbox.clone());
    let report = coordinator(&h, no_analyzer())
        .run(
            request("alice", "Suggest 3-5 relevant follow-up questions"),
            StatusBus::disconnected(),
        )
        .await;

    let state = report.state;
    assert_eq!(chat.call_count(), 0);
    assert_eq!(sandbox.execution_count(), 0);
    let reply = state.messages.last().unwrap();
    assert!(reply.content.contains("UI helper request; no coding task"));
}

// Scope violation: the gate bounces the out-of-manifest patch back
// to the worker with Re-Plan remediation; no iteration cost.
#[tokio::test]
async fn scope_violation_loops_back_without_iteration_cost() {
    let supervisor = r#"{"task_description": "refactor foo", "target_language": "python",
        "route_to": "planner", "confidence": 0.8, "reasoning": "complex"}"#;
    let planner = r#"{"steps": [{"id": 1, "action": "edit src/foo.py"}],
        "touched_files": ["src/foo.py"], "confidence": 0.8, "reasoning": "one file"}"#;
    let worker_bad = r#"{"code": "", "patch_ops": [{"path": "src/bar.py", "op": "modify",
        "text": "x = 1\n"}], "files_touched": ["src/bar.py"], "confidence": 0.7,
        "reasoning": "first try"}"#;
    let worker_good = r#"{"code": "", "patch_ops": [{"path": "src/foo.py", "op": "modify",
        "text": "x = 1\n"}], "files_touched": ["src/foo.py"], "confidence": 0.8,
        "reasoning": "stayed in scope"}"#;

    let chat = ScriptedChat::new(vec![
        supervisor,
        planner,
        worker_bad,
        worker_good,
        CRITIC_APPROVE,
    ]);
    let sandbox = ScriptedSandbox::new(vec![success_result()]);
    let h = harness(chat.clone(), sandbox.clone());
    // Force the supervised path with a complex request.
    let report = coordinator(&h, no_analyzer())
        .run(
            request("bob", "deploy a docker api with kubernetes and parse json"),
            StatusBus::disconnected(),
        )
        .await;

    let state = report.state;
    // The gate rejected once; no iteration was consumed.
    assert_eq!(state.iteration_count, 0);
    let gate_rejections: Vec<_> = state
        .node_traces
        .iter()
        .filter(|t| {
            t.stage == StageKind::IntegrityGate && t.outcome == StageOutcome::NeedsRevision
        })
        .collect();
    assert_eq!(gate_rejections.len(), 1);
    // The worker's retry prompt carried the remediation.
    assert_eq!(chat.call_count(), 5);
    assert!(chat.prompt(3).contains("Re-Plan"));
    // The run still finished successfully.
    assert_eq!(state.integrity_passed, Some(true));
    assert_eq!(sandbox.execution_count(), 1);
}

// Same-failure short-circuit: the second identical fingerprint
// routes to the critic postmortem instead of another retry, and the
// fingerprint list holds one entry, not two.
#[tokio::test]
async fn same_failure_short_circuits_to_postmortem() {
    let worker_fail = r#"{"code": "print(x)", "files_touched": ["hello.py"],
        "confidence": 0.6, "reasoning": "attempt"}"#;
    let critic_postmortem = r#"{"approved": false,
        "overall_assessment": "The same NameError repeated.",
        "revision_feedback": "x is never defined",
        "dark_debt_signal": {"failure_pattern": "NameError", "consistent_failures": 2},
        "confidence": 0.8, "reasoning": "postmortem"}"#;

    let failure = runtime_failure("NameError: name 'x' is not defined");
    let chat = ScriptedChat::new(vec![worker_fail, worker_fail, critic_postmortem]);
    let sandbox = ScriptedSandbox::new(vec![failure.clone(), failure]);
    let h = harness(chat.clone(), sandbox.clone());
    let report = coordinator(&h, no_analyzer())
        .run(
            request("carol", "hello world in python"),
            StatusBus::disconnected(),
        )
        .await;

    let state = report.state;
    assert_eq!(sandbox.execution_count(), 2);
    assert_eq!(state.failure_ids_seen, vec!["runtime:1:NameError"]);
    // One genuine failure cycle, then the short-circuit.
    assert_eq!(state.iteration_count, 1);
    // The traversal ended in a postmortem, not another worker retry.
    assert_eq!(chat.call_count(), 3);
    assert!(state.dark_debt_signal.is_some());
    let reply = state.messages.last().unwrap();
    assert!(reply.content.contains("issue"));
}

// Budget monotonicity: an exhausted sandbox budget terminates the
// traversal before any further execution.
#[tokio::test]
async fn sandbox_budget_exhaustion_terminates() {
    let worker = r#"{"code": "print(1)", "files_touched": ["hello.py"],
        "confidence": 0.9, "reasoning": "simple"}"#;
    let chat = ScriptedChat::new(vec![worker]);
    let sandbox = ScriptedSandbox::new(vec![]);
    let h = harness(chat.clone(), sandbox.clone());
    let mut state = request("dave", "hello world in python");
    state.budgets.sandbox_minutes_used = h.settings.max_sandbox_minutes + 1.0;

    let report = coordinator(&h, no_analyzer())
        .run(state, StatusBus::disconnected())
        .await;

    assert_eq!(sandbox.execution_count(), 0);
    let reply = report.state.messages.last().unwrap();
    assert!(reply.content.contains("Sandbox time limit"));
}

// Pending questions: a clarification parks exactly one question; the next
// request consumes it and resumes at the supervisor.
#[tokio::test]
async fn clarification_parks_and_resumes() {
    let supervisor_asks = r#"{"needs_clarification": true,
        "clarification_question": "Which database do you mean?",
        "confidence": 0.5, "reasoning": "ambiguous"}"#;
    let chat = ScriptedChat::new(vec![supervisor_asks]);
    let sandbox = ScriptedSandbox::new(vec![]);
    let h = harness(chat.clone(), sandbox.clone());
    let coordinator_a = coordinator(&h, no_analyzer());
    let report = coordinator_a
        .run(
            request("erin", "deploy a docker api with kubernetes and parse json"),
            StatusBus::disconnected(),
        )
        .await;

    let reply = report.state.messages.last().unwrap();
    assert!(reply.content.contains("Which database"));
    assert!(h.memory.has_pending("erin"));

    // The follow-up resumes at the supervisor (not the classifier): the
    // supervisor runs again with the answer in context.
    let supervisor_routes = r#"{"task_description": "use postgres",
        "route_to": "worker", "confidence": 0.9, "reasoning": "clear now"}"#;
    let chat2 = ScriptedChat::new(vec![supervisor_routes, WORKER_HELLO, CRITIC_APPROVE]);
    let sandbox2 = ScriptedSandbox::new(vec![success_result()]);
    let mut h2 = harness(chat2.clone(), sandbox2);
    // Share the memory so the pending question carries over.
    h2.services.memory = h.memory.clone();
    let graph = Arc::new(build_graph(h2.services.clone(), no_analyzer()).unwrap());
    let coordinator_b = Coordinator::new(graph, no_analyzer(), h.memory.clone(), h2.settings.clone());

    let report2 = coordinator_b
        .run(request("erin", "postgres"), StatusBus::disconnected())
        .await;
    assert!(!h.memory.has_pending("erin"));
    // Classifier was skipped: the first model call is the supervisor.
    assert!(chat2.prompt(0).contains("supervisor"));
    assert!(report2.state.messages.last().unwrap().is_reply());
}

// Critic rejection re-enters the supervisor in guard mode and the guard
// forbids a planner downgrade.
#[tokio::test]
async fn critic_rejection_reenters_supervisor_guarded() {
    let critic_reject = r#"{"approved": false,
        "revision_feedback": "Handle the empty-file case.",
        "confidence": 0.7, "reasoning": "missing edge case"}"#;
    // The guarded supervisor tries to route to the planner; the router
    // must send the flow to the curator instead.
    let supervisor_guarded = r#"{"route_to": "planner", "confidence": 0.8,
        "reasoning": "wants replanning"}"#;
    let worker_fixed = r#"{"code": "print(\"Hello, world!\")", "files_touched": ["hello.py"],
        "confidence": 0.9, "reasoning": "fixed"}"#;

    let chat = ScriptedChat::new(vec![
        WORKER_HELLO,
        critic_reject,
        supervisor_guarded,
        worker_fixed,
        CRITIC_APPROVE,
    ]);
    let sandbox = ScriptedSandbox::new(vec![success_result(), success_result()]);
    let h = harness(chat.clone(), sandbox.clone());
    let report = coordinator(&h, no_analyzer())
        .run(
            request("frank", "hello world in python"),
            StatusBus::disconnected(),
        )
        .await;

    let state = report.state;
    // Guard mode was surfaced to the supervisor prompt.
    assert!(chat.prompt(2).contains("Guard mode"));
    // The planner never ran.
    assert!(!state
        .node_traces
        .iter()
        .any(|t| t.stage == StageKind::Planner));
    assert_eq!(state.critic_approved, Some(true));
}
