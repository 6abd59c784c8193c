//! Typed clients for the orchestrator's external collaborators.
//!
//! Model endpoints, the embedder/reranker, the vector store, the sandbox
//! service and the static-analysis gateway are out of scope as
//! implementations; this module specifies exactly the data the core sends
//! into and expects back from each, as traits with `reqwest`-backed
//! production impls. Stages depend on the traits so tests can substitute
//! deterministic stubs.
//!
//! Every outbound request carries an `X-Synesis-Request-ID` header that is
//! recorded in the corresponding [`crate::evidence::ToolRef`] for log
//! correlation.

mod http;
mod retrieval;

pub use http::{
    HttpAnalysisClient, HttpChatModel, HttpEmbeddingsClient, HttpRerankClient, HttpSandboxClient,
    HttpVectorStore,
};
pub use retrieval::{RetrievalService, RetrievalServiceConfig};

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::Message;
use crate::sandbox::SandboxResult;

/// Correlation header attached to every tool invocation.
pub const REQUEST_ID_HEADER: &str = "X-Synesis-Request-ID";

/// Errors surfaced by external-service clients.
#[derive(Debug, Error, Diagnostic)]
pub enum ClientError {
    /// The service was unreachable or the transport failed.
    #[error("transport error talking to {service}: {message}")]
    #[diagnostic(code(synesis::clients::transport))]
    Transport { service: &'static str, message: String },

    /// The service answered with a non-success status.
    #[error("{service} returned status {status}")]
    #[diagnostic(code(synesis::clients::status))]
    Status { service: &'static str, status: u16 },

    /// The response body did not match the contract.
    #[error("malformed {service} response: {message}")]
    #[diagnostic(code(synesis::clients::malformed))]
    Malformed { service: &'static str, message: String },

    /// The circuit breaker for this service is open.
    #[error("{service} circuit breaker open")]
    #[diagnostic(
        code(synesis::clients::breaker_open),
        help("The service is degraded; the stage should skip or fall back.")
    )]
    BreakerOpen { service: &'static str },
}

/// Embedding service: `POST /embeddings`.
#[async_trait]
pub trait EmbeddingsClient: Send + Sync {
    /// Embed a batch of texts, one vector per input.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClientError>;
}

/// Optional reranker: `POST /rerank` with `{query, passages}` → `{scores}`.
#[async_trait]
pub trait RerankClient: Send + Sync {
    /// Score each passage against the query; same order as the input.
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, ClientError>;
}

/// A record stored in or returned from the vector store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Similarity score on query results; absent on upserts.
    #[serde(default)]
    pub score: Option<f32>,
    /// Schema fields (`chunk_id`, `text`, `source`, `language`, ...).
    #[serde(default)]
    pub fields: Value,
}

/// Vector store supporting upsert/query over named collections.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), ClientError>;
    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorRecord>, ClientError>;
    /// BM25 keyword search over the collection, for hybrid retrieval and
    /// as the fallback when the vector path is down.
    async fn keyword_search(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<VectorRecord>, ClientError>;
}

/// Sandbox service: `POST /execute` with `{language, code, filename}`.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    async fn execute(
        &self,
        language: &str,
        code: &str,
        filename: &str,
        request_id: &str,
    ) -> Result<SandboxResult, ClientError>;
}

/// One diagnostic from the analysis gateway.
pub type AnalysisDiagnostic = crate::sandbox::Diagnostic;

/// Response from the static-analysis gateway's `POST /analyze`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub diagnostics: Vec<AnalysisDiagnostic>,
    #[serde(default)]
    pub analysis_time_ms: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub skipped: bool,
}

/// Static-analysis gateway client.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn analyze(
        &self,
        language: &str,
        code: &str,
        filename: Option<&str>,
        request_id: &str,
    ) -> Result<AnalysisReport, ClientError>;
}

/// Chat-completion model endpoint (OpenAI-compatible).
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// One completion for the message list; returns the assistant text.
    async fn complete(&self, messages: &[Message], request_id: &str)
        -> Result<String, ClientError>;
}

/// Sandbox executor with warm-pool-first routing.
///
/// The pre-warmed pool is tried first; on transport failure or a
/// non-success status the executor silently falls through to the ephemeral
/// path. Warm-pool readiness dropping during execution is what shifts
/// service-level traffic to idle pods, so unavailability here is an
/// expected signal, not an error.
pub struct SandboxExecutor {
    warm_pool: std::sync::Arc<dyn SandboxClient>,
    ephemeral: Option<std::sync::Arc<dyn SandboxClient>>,
}

impl SandboxExecutor {
    /// Executor over a warm pool with an optional ephemeral fallback.
    #[must_use]
    pub fn new(
        warm_pool: std::sync::Arc<dyn SandboxClient>,
        ephemeral: Option<std::sync::Arc<dyn SandboxClient>>,
    ) -> Self {
        Self {
            warm_pool,
            ephemeral,
        }
    }

    /// Execute, preferring the warm pool.
    pub async fn execute(
        &self,
        language: &str,
        code: &str,
        filename: &str,
        request_id: &str,
    ) -> Result<SandboxResult, ClientError> {
        match self
            .warm_pool
            .execute(language, code, filename, request_id)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                if let Some(ephemeral) = &self.ephemeral {
                    tracing::info!(%err, "warm pool unavailable, falling back to ephemeral job");
                    ephemeral.execute(language, code, filename, request_id).await
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// File extension used for the sandbox script filename.
#[must_use]
pub fn language_extension(language: &str) -> &'static str {
    match language {
        "bash" | "shell" | "sh" => "sh",
        "python" | "py" => "py",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "c" => "c",
        "cpp" | "c++" => "cpp",
        "java" => "java",
        "go" => "go",
        "rust" => "rs",
        _ => "txt",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSandbox;
    struct OkSandbox;

    #[async_trait]
    impl SandboxClient for FailingSandbox {
        async fn execute(
            &self,
            _language: &str,
            _code: &str,
            _filename: &str,
            _request_id: &str,
        ) -> Result<SandboxResult, ClientError> {
            Err(ClientError::Transport {
                service: "sandbox",
                message: "connection refused".into(),
            })
        }
    }

    #[async_trait]
    impl SandboxClient for OkSandbox {
        async fn execute(
            &self,
            _language: &str,
            _code: &str,
            _filename: &str,
            _request_id: &str,
        ) -> Result<SandboxResult, ClientError> {
            Ok(SandboxResult::default())
        }
    }

    #[tokio::test]
    async fn warm_pool_failure_falls_through_to_ephemeral() {
        let executor = SandboxExecutor::new(
            std::sync::Arc::new(FailingSandbox),
            Some(std::sync::Arc::new(OkSandbox)),
        );
        let result = executor.execute("python", "print(1)", "script.py", "r1").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn no_fallback_propagates_error() {
        let executor = SandboxExecutor::new(std::sync::Arc::new(FailingSandbox), None);
        let result = executor.execute("python", "print(1)", "script.py", "r1").await;
        assert!(result.is_err());
    }

    #[test]
    fn extensions_cover_supported_languages() {
        assert_eq!(language_extension("python"), "py");
        assert_eq!(language_extension("bash"), "sh");
        assert_eq!(language_extension("unknown"), "txt");
    }
}
