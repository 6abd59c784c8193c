//! Configuration: environment-driven settings and the layered defaults
//! policy.
//!
//! All tunables resolve from environment variables under the `SYNESIS_`
//! prefix (a `.env` file is honoured via `dotenvy`). The defaults policy
//! layers code constants, then an organization YAML, then a project YAML;
//! hard-fenced fields ignore overrides entirely.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

/// Runtime settings resolved once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    // Service endpoints
    pub embedder_url: String,
    pub reranker_url: Option<String>,
    pub vector_store_url: String,
    pub sandbox_warm_pool_url: String,
    pub analysis_gateway_url: String,
    pub chat_model_url: String,
    pub chat_model_name: String,

    // Graph behavior
    pub max_iterations: u32,
    pub node_timeout: Duration,
    pub sandbox_timeout: Duration,
    pub analysis_timeout: Duration,
    pub lsp_enabled: bool,
    /// `"on_failure"` runs the analyzer only after sandbox failures;
    /// `"always"` inserts it between the gate and the sandbox.
    pub lsp_mode: String,

    // Budgets
    pub max_sandbox_minutes: f64,
    pub max_lsp_calls: u32,
    pub max_evidence_experiments: u32,
    pub token_budget: i64,

    // Retrieval / curation
    pub rag_top_k: usize,
    pub rag_overfetch: usize,
    pub max_retrieval_chars: usize,
    pub curation_mode: String,
    pub recurate_on_retry: bool,
    pub drift_jaccard_threshold: f64,
    pub budget_alert_threshold: f64,
    pub arch_standards_collections: Vec<String>,
    pub injection_scan_enabled: bool,
    pub injection_action: String,

    // Integrity gate
    pub target_workspace: String,
    pub max_code_chars: usize,
    pub max_patch_file_chars: usize,
    pub path_denylist: Vec<String>,
    pub trusted_packages: Vec<String>,
    pub experiment_max_commands: usize,
    pub evidence_command_allowlist: Vec<String>,

    // Memory
    pub memory_max_turns_per_user: usize,
    pub memory_max_users: usize,
    pub memory_ttl: Duration,
    pub pending_question_ttl: Duration,

    // Caches & breakers
    pub failfast_max_size: usize,
    pub failfast_ttl: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,

    // Defaults policy files
    pub defaults_policy_path: Option<String>,
    pub project_manifest_path: Option<String>,

    // Classifier
    pub intent_weights_path: Option<String>,
    pub intent_plugins_dir: Option<String>,

    // API
    pub bind_addr: String,
    pub model_id: String,
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match var(key).map(|v| v.parse::<T>()) {
        Some(Ok(parsed)) => parsed,
        Some(Err(_)) => {
            warn!(key, "unparseable setting, using default");
            default
        }
        None => default,
    }
}

fn list_or(key: &str, default: &[&str]) -> Vec<String> {
    match var(key) {
        Some(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Settings {
    /// Resolve settings from the environment. Never fails: malformed values
    /// fall back to defaults with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            embedder_url: var_or("SYNESIS_EMBEDDER_URL", "http://embedder:8080"),
            reranker_url: var("SYNESIS_RERANKER_URL"),
            vector_store_url: var_or("SYNESIS_VECTOR_STORE_URL", "http://vector-store:19530"),
            sandbox_warm_pool_url: var_or("SYNESIS_SANDBOX_URL", "http://sandbox:8000"),
            analysis_gateway_url: var_or("SYNESIS_ANALYSIS_URL", "http://lsp-gateway:8000"),
            chat_model_url: var_or("SYNESIS_CHAT_MODEL_URL", "http://model-serving:8000/v1"),
            chat_model_name: var_or("SYNESIS_CHAT_MODEL_NAME", "synesis-worker"),
            max_iterations: parse_or("SYNESIS_MAX_ITERATIONS", 3),
            node_timeout: Duration::from_secs(parse_or("SYNESIS_NODE_TIMEOUT_SECONDS", 90)),
            sandbox_timeout: Duration::from_secs(parse_or("SYNESIS_SANDBOX_TIMEOUT_SECONDS", 60)),
            analysis_timeout: Duration::from_secs(parse_or("SYNESIS_ANALYSIS_TIMEOUT_SECONDS", 20)),
            lsp_enabled: parse_or("SYNESIS_LSP_ENABLED", true),
            lsp_mode: var_or("SYNESIS_LSP_MODE", "on_failure"),
            max_sandbox_minutes: parse_or("SYNESIS_MAX_SANDBOX_MINUTES", 5.0),
            max_lsp_calls: parse_or("SYNESIS_MAX_LSP_CALLS", 6),
            max_evidence_experiments: parse_or("SYNESIS_MAX_EVIDENCE_EXPERIMENTS", 3),
            token_budget: parse_or("SYNESIS_TOKEN_BUDGET", 200_000),
            rag_top_k: parse_or("SYNESIS_RAG_TOP_K", 5),
            rag_overfetch: parse_or("SYNESIS_RAG_OVERFETCH", 3),
            max_retrieval_chars: parse_or("SYNESIS_MAX_RETRIEVAL_CHARS", 24_000),
            curation_mode: var_or("SYNESIS_CURATION_MODE", "adaptive"),
            recurate_on_retry: parse_or("SYNESIS_RECURATE_ON_RETRY", true),
            drift_jaccard_threshold: parse_or("SYNESIS_DRIFT_JACCARD_THRESHOLD", 0.2),
            budget_alert_threshold: parse_or("SYNESIS_BUDGET_ALERT_THRESHOLD", 0.85),
            arch_standards_collections: list_or(
                "SYNESIS_ARCH_STANDARDS_COLLECTIONS",
                &["arch_standards_v1"],
            ),
            injection_scan_enabled: parse_or("SYNESIS_INJECTION_SCAN_ENABLED", true),
            injection_action: var_or("SYNESIS_INJECTION_ACTION", "reduce"),
            target_workspace: var_or("SYNESIS_TARGET_WORKSPACE", ""),
            max_code_chars: parse_or("SYNESIS_MAX_CODE_CHARS", 100_000),
            max_patch_file_chars: parse_or("SYNESIS_MAX_PATCH_FILE_CHARS", 50_000),
            path_denylist: list_or(
                "SYNESIS_PATH_DENYLIST",
                &[
                    "package-lock.json",
                    "yarn.lock",
                    "Cargo.lock",
                    "poetry.lock",
                    "pnpm-lock.yaml",
                ],
            ),
            trusted_packages: list_or("SYNESIS_TRUSTED_PACKAGES", &[]),
            experiment_max_commands: parse_or("SYNESIS_EXPERIMENT_MAX_COMMANDS", 10),
            evidence_command_allowlist: list_or(
                "SYNESIS_EVIDENCE_COMMAND_ALLOWLIST",
                &["python", "python3", "pytest", "bash", "sh", "node", "go", "cargo"],
            ),
            memory_max_turns_per_user: parse_or("SYNESIS_MEMORY_MAX_TURNS_PER_USER", 20),
            memory_max_users: parse_or("SYNESIS_MEMORY_MAX_USERS", 5000),
            memory_ttl: Duration::from_secs(parse_or("SYNESIS_MEMORY_TTL_SECONDS", 14_400)),
            pending_question_ttl: Duration::from_secs(parse_or(
                "SYNESIS_PENDING_QUESTION_TTL_SECONDS",
                1_800,
            )),
            failfast_max_size: parse_or("SYNESIS_FAILFAST_MAX_SIZE", 1000),
            failfast_ttl: Duration::from_secs(parse_or("SYNESIS_FAILFAST_TTL_SECONDS", 86_400)),
            breaker_failure_threshold: parse_or("SYNESIS_BREAKER_FAILURE_THRESHOLD", 3),
            breaker_reset_timeout: Duration::from_secs(parse_or(
                "SYNESIS_BREAKER_RESET_SECONDS",
                30,
            )),
            defaults_policy_path: var("SYNESIS_DEFAULTS_PATH"),
            project_manifest_path: var("SYNESIS_PROJECT_MANIFEST_PATH"),
            intent_weights_path: var("SYNESIS_INTENT_WEIGHTS"),
            intent_plugins_dir: var("SYNESIS_INTENT_PLUGINS_DIR"),
            bind_addr: var_or("SYNESIS_BIND_ADDR", "0.0.0.0:8080"),
            model_id: var_or("SYNESIS_MODEL_ID", "synesis-agent"),
        }
    }
}

// ── Defaults policy ────────────────────────────────────────────────────

/// YAML-overridable defaults document.
#[derive(Clone, Debug, Default, Deserialize)]
struct PolicyOverlay {
    default_language: Option<String>,
    default_test_runner: Option<String>,
    plan_required_for_small: Option<bool>,
    plan_required_for_trivial: Option<bool>,
    plan_approval_min_steps: Option<usize>,
    // Hard-fenced; present so operator YAML parses, but never honoured.
    #[serde(default)]
    allow_questions_for_trivial: Option<bool>,
}

/// Resolved defaults policy: code constants with YAML layered on top.
///
/// `allow_questions_for_trivial` is a hard fence: the trivial fast path
/// never asks questions, regardless of configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultsPolicy {
    pub default_language: String,
    pub default_test_runner: String,
    pub allow_questions_for_trivial: bool,
    pub plan_required_for_small: bool,
    pub plan_required_for_trivial: bool,
    pub plan_approval_min_steps: usize,
    /// Which layer produced the final values: `code`, `org`, or `project`.
    pub source: &'static str,
}

impl Default for DefaultsPolicy {
    fn default() -> Self {
        Self {
            default_language: "python".into(),
            default_test_runner: "pytest".into(),
            allow_questions_for_trivial: false,
            plan_required_for_small: false,
            plan_required_for_trivial: false,
            plan_approval_min_steps: 0,
            source: "code",
        }
    }
}

impl DefaultsPolicy {
    /// Resolve the policy: code defaults, then org YAML, then project YAML.
    #[must_use]
    pub fn resolve(org_path: Option<&Path>, project_path: Option<&Path>) -> Self {
        let mut policy = Self::default();
        for (path, source) in [(org_path, "org"), (project_path, "project")] {
            let Some(path) = path else { continue };
            match load_overlay(path) {
                Some(overlay) => {
                    policy.merge(overlay);
                    policy.source = source;
                }
                None => debug!(?path, "defaults overlay missing or invalid, skipping"),
            }
        }
        policy
    }

    fn merge(&mut self, overlay: PolicyOverlay) {
        if let Some(v) = overlay.default_language {
            self.default_language = v;
        }
        if let Some(v) = overlay.default_test_runner {
            self.default_test_runner = v;
        }
        if let Some(v) = overlay.plan_required_for_small {
            self.plan_required_for_small = v;
        }
        if let Some(v) = overlay.plan_required_for_trivial {
            self.plan_required_for_trivial = v;
        }
        if let Some(v) = overlay.plan_approval_min_steps {
            self.plan_approval_min_steps = v;
        }
        if overlay.allow_questions_for_trivial.is_some() {
            warn!("allow_questions_for_trivial is hard-fenced; YAML override ignored");
        }
    }

    /// Default `touched_files` manifest for a trivial task.
    #[must_use]
    pub fn trivial_files(&self, language: &str, include_tests: bool) -> Vec<String> {
        if language == "python" {
            if include_tests {
                vec!["hello.py".into(), "test_hello.py".into()]
            } else {
                vec!["hello.py".into()]
            }
        } else if include_tests {
            vec!["main".to_string(), "main_test".to_string()]
        } else {
            vec!["main".to_string()]
        }
    }

    /// Human-readable defaults for the trivial-task micro-ack.
    #[must_use]
    pub fn defaults_used(&self, language: &str) -> Vec<String> {
        if language == "python" {
            vec!["Python 3".into(), self.default_test_runner.clone()]
        } else {
            vec!["default runtime".into()]
        }
    }
}

fn load_overlay(path: &Path) -> Option<PolicyOverlay> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_yaml::from_str::<PolicyOverlay>(&raw) {
        Ok(overlay) => Some(overlay),
        Err(err) => {
            warn!(?path, %err, "defaults policy YAML failed to parse");
            None
        }
    }
}
