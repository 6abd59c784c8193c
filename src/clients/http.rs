//! `reqwest`-backed client implementations.
//!
//! One long-lived [`reqwest::Client`] is shared across all of these for
//! connection pooling; construct them from the same client instance.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    AnalysisClient, AnalysisReport, ChatModel, ClientError, EmbeddingsClient, RerankClient,
    SandboxClient, VectorRecord, VectorStore, REQUEST_ID_HEADER,
};
use crate::message::Message;
use crate::sandbox::SandboxResult;

fn transport(service: &'static str, err: reqwest::Error) -> ClientError {
    ClientError::Transport {
        service,
        message: err.to_string(),
    }
}

fn check_status(service: &'static str, resp: &reqwest::Response) -> Result<(), ClientError> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ClientError::Status {
            service,
            status: status.as_u16(),
        })
    }
}

// ── Embeddings ─────────────────────────────────────────────────────────

/// `POST {base}/embeddings` with `{input, model}`.
pub struct HttpEmbeddingsClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbeddingsClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingsClient for HttpEmbeddingsClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClientError> {
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&json!({"input": texts, "model": self.model}))
            .send()
            .await
            .map_err(|e| transport("embedder", e))?;
        check_status("embedder", &resp)?;
        let body: EmbeddingsResponse = resp.json().await.map_err(|e| ClientError::Malformed {
            service: "embedder",
            message: e.to_string(),
        })?;
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ── Reranker ───────────────────────────────────────────────────────────

/// `POST {base}/rerank` with `{query, passages}` → `{scores}`.
pub struct HttpRerankClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f64>,
}

impl HttpRerankClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RerankClient for HttpRerankClient {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, ClientError> {
        let resp = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&json!({"query": query, "passages": passages}))
            .send()
            .await
            .map_err(|e| transport("reranker", e))?;
        check_status("reranker", &resp)?;
        let body: RerankResponse = resp.json().await.map_err(|e| ClientError::Malformed {
            service: "reranker",
            message: e.to_string(),
        })?;
        Ok(body.scores)
    }
}

// ── Vector store ───────────────────────────────────────────────────────

/// REST facade over the vector store's upsert/query/keyword endpoints.
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVectorStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<VectorRecord>,
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(format!("{}/collections/{collection}/upsert", self.base_url))
            .json(&json!({"records": records}))
            .send()
            .await
            .map_err(|e| transport("vector-store", e))?;
        check_status("vector-store", &resp)
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorRecord>, ClientError> {
        let resp = self
            .client
            .post(format!("{}/collections/{collection}/query", self.base_url))
            .json(&json!({"embedding": embedding, "top_k": top_k}))
            .send()
            .await
            .map_err(|e| transport("vector-store", e))?;
        check_status("vector-store", &resp)?;
        let body: QueryResponse = resp.json().await.map_err(|e| ClientError::Malformed {
            service: "vector-store",
            message: e.to_string(),
        })?;
        Ok(body.results)
    }

    async fn keyword_search(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<VectorRecord>, ClientError> {
        let resp = self
            .client
            .post(format!("{}/collections/{collection}/search", self.base_url))
            .json(&json!({"query": query, "top_k": top_k}))
            .send()
            .await
            .map_err(|e| transport("vector-store", e))?;
        check_status("vector-store", &resp)?;
        let body: QueryResponse = resp.json().await.map_err(|e| ClientError::Malformed {
            service: "vector-store",
            message: e.to_string(),
        })?;
        Ok(body.results)
    }
}

// ── Sandbox ────────────────────────────────────────────────────────────

/// Warm-pool sandbox: `POST {base}/execute` with `{language, code, filename}`.
pub struct HttpSandboxClient {
    client: reqwest::Client,
    base_url: String,
    timeout: std::time::Duration,
}

impl HttpSandboxClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SandboxClient for HttpSandboxClient {
    async fn execute(
        &self,
        language: &str,
        code: &str,
        filename: &str,
        request_id: &str,
    ) -> Result<SandboxResult, ClientError> {
        let resp = self
            .client
            .post(format!("{}/execute", self.base_url))
            .header(REQUEST_ID_HEADER, request_id)
            .timeout(self.timeout + std::time::Duration::from_secs(2))
            .json(&json!({"language": language, "code": code, "filename": filename}))
            .send()
            .await
            .map_err(|e| transport("sandbox", e))?;
        check_status("sandbox", &resp)?;
        resp.json().await.map_err(|e| ClientError::Malformed {
            service: "sandbox",
            message: e.to_string(),
        })
    }
}

// ── Analysis gateway ───────────────────────────────────────────────────

/// `POST {base}/analyze` with `{code, language, filename?}`.
pub struct HttpAnalysisClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnalysisClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    async fn analyze(
        &self,
        language: &str,
        code: &str,
        filename: Option<&str>,
        request_id: &str,
    ) -> Result<AnalysisReport, ClientError> {
        let mut body = json!({"code": code, "language": language});
        if let Some(name) = filename {
            body["filename"] = json!(name);
        }
        let resp = self
            .client
            .post(format!("{}/analyze", self.base_url))
            .header(REQUEST_ID_HEADER, request_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport("analysis", e))?;
        check_status("analysis", &resp)?;
        resp.json().await.map_err(|e| ClientError::Malformed {
            service: "analysis",
            message: e.to_string(),
        })
    }
}

// ── Chat model ─────────────────────────────────────────────────────────

/// OpenAI-compatible chat endpoint used for the model-backed stages.
pub struct HttpChatModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpChatModel {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(
        &self,
        messages: &[Message],
        request_id: &str,
    ) -> Result<String, ClientError> {
        let wire: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(REQUEST_ID_HEADER, request_id)
            .json(&json!({"model": self.model, "messages": wire, "stream": false}))
            .send()
            .await
            .map_err(|e| transport("chat-model", e))?;
        check_status("chat-model", &resp)?;
        let body: Value = resp.json().await.map_err(|e| ClientError::Malformed {
            service: "chat-model",
            message: e.to_string(),
        })?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or(ClientError::Malformed {
                service: "chat-model",
                message: "missing choices[0].message.content".into(),
            })
    }
}
