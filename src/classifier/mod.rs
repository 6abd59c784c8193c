//! Deterministic intent classification.
//!
//! The classifier runs first on every request and never calls a model: a
//! YAML-driven scoring engine sizes the task, ordered regexes detect the
//! target language, UI-helper prompts are routed away from the coding
//! workflow, and trivial tasks are seeded with defaults so they can skip
//! the supervisor entirely.

mod engine;
mod plugins;

pub use engine::{
    builtin_fallback, Category, Overrides, Pairing, ScoreAnalysis, ScoringEngine, Thresholds,
    WeightsConfig, SATURATED_SCORE,
};
pub use plugins::load_config;

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::DefaultsPolicy;
use crate::types::{InteractionMode, MessageOrigin, PromptTier, TaskSize};

/// Everything the classifier decides about a request.
#[derive(Clone, Debug)]
pub struct IntentEnvelope {
    pub task_size: TaskSize,
    pub score: i64,
    pub target_language: String,
    pub interaction_mode: InteractionMode,
    pub message_origin: MessageOrigin,
    pub worker_prompt_tier: PromptTier,
    pub bypass_supervisor: bool,
    pub bypass_planner: bool,
    pub plan_required: bool,
    pub clarification_budget: u32,
    pub active_domain_refs: Vec<String>,
    pub classification_hits: Vec<String>,
    /// Seeded for trivial tasks only.
    pub task_description: Option<String>,
    pub touched_files: Vec<String>,
    pub defaults_used: Vec<String>,
    pub allowed_tools: Vec<String>,
}

/// Default language when detection finds nothing.
pub const DEFAULT_LANGUAGE: &str = "python";

fn language_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Ordered: more specific patterns first so "typescript" does not
        // fall through to "javascript", and "java" excludes "javascript".
        [
            (r"(?i)\btypescript\b|\.tsx?\b", "typescript"),
            (r"(?i)\bjavascript\b|\.jsx?\b|\.mjs\b", "javascript"),
            (
                r"(?i)\bpython\b|\.py\b|\bpytest\b|\bpip\b|\bfastapi\b",
                "python",
            ),
            (r"(?i)\bgolang\b|\bgo\s+(?:lang|code|script)\b|\.go\b", "go"),
            (r"(?i)\brust\b|\.rs\b", "rust"),
            (r"(?i)\bjava\b(?!\s*script)|\.java\b", "java"),
            (r"(?i)\bc#|\bcsharp\b|\.cs\b", "csharp"),
            (r"(?i)\bbash\b|\bshell\b|\.sh\b|\bsh script\b", "bash"),
        ]
        .into_iter()
        .filter_map(|(src, lang)| Regex::new(src).ok().map(|re| (re, lang)))
        .collect()
    })
}

fn ui_helper_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)suggest\s+(?:3[- ]?5\s+)?(?:relevant\s+)?follow[- ]?up\s+questions?",
            r"(?i)output\s+must\s+be\s+(?:a\s+)?JSON\s+array",
            r"(?i)###\s*Task:\s*(?:Suggest|Generate)\s+",
            r"(?i)generate\s+a\s+concise\s+title",
        ]
        .into_iter()
        .filter_map(|src| Regex::new(src).ok())
        .collect()
    })
}

/// Best-effort language detection from the request text.
#[must_use]
pub fn detect_language(text: &str) -> String {
    let t: String = text.trim().chars().take(800).collect();
    if t.is_empty() {
        return DEFAULT_LANGUAGE.to_string();
    }
    for (pattern, lang) in language_patterns() {
        if pattern.is_match(&t) {
            return (*lang).to_string();
        }
    }
    DEFAULT_LANGUAGE.to_string()
}

/// Classify where a message came from; UI-helper prompts are not coding
/// tasks.
#[must_use]
pub fn classify_origin(text: &str) -> MessageOrigin {
    let t: String = text.trim().chars().take(600).collect();
    if t.is_empty() {
        return MessageOrigin::EndUser;
    }
    for pattern in ui_helper_patterns() {
        if pattern.is_match(&t) {
            return MessageOrigin::UiHelper;
        }
    }
    MessageOrigin::EndUser
}

/// Did the user explicitly ask for tests? One-liners don't get a test
/// file by default.
#[must_use]
pub fn wants_tests(text: &str) -> bool {
    let t = text.to_lowercase();
    t.contains("test") || t.contains("pytest") || t.contains("validate") || t.contains("validation")
}

/// The classifier itself: a compiled engine plus the defaults policy.
pub struct IntentClassifier {
    engine: ScoringEngine,
    policy: DefaultsPolicy,
}

impl IntentClassifier {
    /// Build from already-merged configuration.
    #[must_use]
    pub fn new(config: WeightsConfig, policy: DefaultsPolicy) -> Self {
        Self {
            engine: ScoringEngine::new(config),
            policy,
        }
    }

    /// Build by loading the core YAML and plugin overlays from disk.
    #[must_use]
    pub fn from_paths(
        core_path: Option<&Path>,
        plugin_dir: Option<&Path>,
        policy: DefaultsPolicy,
    ) -> Self {
        Self::new(load_config(core_path, plugin_dir), policy)
    }

    /// Classify the latest user content into an [`IntentEnvelope`].
    #[must_use]
    pub fn classify(&self, content: &str) -> IntentEnvelope {
        let message_origin = classify_origin(content);
        let target_language = detect_language(content);
        let analysis = self.engine.analyze(content);

        let task_size = analysis.task_size;
        let trivial = task_size == TaskSize::Trivial && !analysis.manual_override;

        let worker_prompt_tier = if analysis.force_pro_advanced || analysis.manual_override {
            PromptTier::Full
        } else if trivial {
            PromptTier::Lite
        } else {
            PromptTier::Standard
        };

        // Clarification budget is capped per size class. The hard fence:
        // the trivial fast path never asks.
        let clarification_budget = match task_size {
            TaskSize::Trivial => 0,
            TaskSize::Small => 1,
            TaskSize::Complex => 2,
        };

        let (task_description, touched_files, defaults_used, allowed_tools) = if trivial {
            let include_tests = wants_tests(content);
            (
                Some(content.trim().to_string()),
                self.policy.trivial_files(&target_language, include_tests),
                self.policy.defaults_used(&target_language),
                vec!["sandbox".to_string()],
            )
        } else {
            (None, Vec::new(), Vec::new(), Vec::new())
        };

        IntentEnvelope {
            task_size,
            score: analysis.score,
            target_language,
            interaction_mode: analysis.interaction_mode,
            message_origin,
            worker_prompt_tier,
            bypass_supervisor: trivial,
            bypass_planner: trivial || task_size == TaskSize::Small,
            plan_required: task_size == TaskSize::Complex,
            clarification_budget,
            active_domain_refs: analysis.active_domains,
            classification_hits: analysis.classification_hits,
            task_description,
            touched_files,
            defaults_used,
            allowed_tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> IntentClassifier {
        IntentClassifier::new(builtin_fallback(), DefaultsPolicy::default())
    }

    #[test]
    fn trivial_python_bypasses_supervisor() {
        let envelope = classifier().classify("hello world in python");
        assert_eq!(envelope.task_size, TaskSize::Trivial);
        assert_eq!(envelope.target_language, "python");
        assert!(envelope.bypass_supervisor);
        assert_eq!(envelope.clarification_budget, 0);
        assert_eq!(envelope.touched_files, vec!["hello.py".to_string()]);
    }

    #[test]
    fn trivial_with_test_request_gets_test_file() {
        let envelope = classifier().classify("hello world in python with a test");
        assert!(envelope
            .touched_files
            .contains(&"test_hello.py".to_string()));
    }

    #[test]
    fn ui_helper_is_flagged() {
        let envelope = classifier().classify("Suggest 3-5 relevant follow-up questions");
        assert_eq!(envelope.message_origin, MessageOrigin::UiHelper);
    }

    #[test]
    fn manual_override_routes_through_supervisor() {
        let envelope = classifier().classify("[STRICT] print hello");
        assert!(!envelope.bypass_supervisor);
        assert_eq!(envelope.task_size, TaskSize::Complex);
        assert_eq!(envelope.worker_prompt_tier, PromptTier::Full);
        assert!(envelope.plan_required);
    }

    #[test]
    fn language_detection_order_is_specific_first() {
        assert_eq!(detect_language("a typescript cli"), "typescript");
        assert_eq!(detect_language("some java thing"), "java");
        assert_eq!(detect_language("javascript widget"), "javascript");
        assert_eq!(detect_language("anything else"), DEFAULT_LANGUAGE);
    }

    #[test]
    fn complex_task_requires_plan() {
        let envelope =
            classifier().classify("deploy a docker api with kubernetes and parse json");
        assert_eq!(envelope.task_size, TaskSize::Complex);
        assert!(envelope.plan_required);
        assert!(!envelope.bypass_supervisor);
    }
}
