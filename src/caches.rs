//! Failure caches: short-term in-memory outcomes and the long-term
//! vector-indexed failure store.
//!
//! The [`FailFastCache`] is an LRU, TTL-bounded map keyed by
//! `hash(task_description + language)`; the supervisor queries it to inject
//! "known-good pattern" or "avoid this mistake" hints before generation.
//! The [`FailureStore`] embeds `(code + error)` and persists to the
//! retrieval store's `failures_v1` collection for cross-user similarity
//! search. The [`KnowledgeBacklog`] records low-confidence retrieval
//! queries so indexers can close the gap later.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use crate::clients::{ClientError, EmbeddingsClient, VectorRecord, VectorStore};
use crate::evidence::compact_hash;
use crate::sandbox::SandboxResult;

/// Outcome recorded for a task/language pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// A cached execution outcome.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub task_description: String,
    pub language: String,
    pub outcome: Outcome,
    pub code: String,
    pub error_summary: String,
    stored_at: Instant,
    pub hit_count: u32,
}

const TASK_CAP: usize = 512;
const CODE_CAP: usize = 4096;
const ERROR_CAP: usize = 2048;

/// Thread-safe LRU cache of recent execution outcomes.
pub struct FailFastCache {
    max_size: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    // Insertion-ordered key list carries the LRU order; the map holds the
    // entries. Sizes are small enough that the O(n) reorder is fine.
    order: Vec<String>,
    entries: rustc_hash::FxHashMap<String, CacheEntry>,
}

impl FailFastCache {
    /// Create a cache with the given bounds.
    #[must_use]
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn key(task_description: &str, language: &str) -> String {
        let raw = format!(
            "{}:{}",
            task_description.trim().to_lowercase(),
            language.trim().to_lowercase()
        );
        compact_hash(&raw)
    }

    /// Store an outcome, evicting expired and over-capacity entries.
    pub fn put(
        &self,
        task_description: &str,
        language: &str,
        outcome: Outcome,
        code: &str,
        error_summary: &str,
    ) {
        let key = Self::key(task_description, language);
        let entry = CacheEntry {
            task_description: task_description.chars().take(TASK_CAP).collect(),
            language: language.to_string(),
            outcome,
            code: code.chars().take(CODE_CAP).collect(),
            error_summary: error_summary.chars().take(ERROR_CAP).collect(),
            stored_at: Instant::now(),
            hit_count: 0,
        };
        let mut inner = self.lock();
        self.evict_expired(&mut inner);
        inner.order.retain(|k| k != &key);
        inner.order.push(key.clone());
        inner.entries.insert(key, entry);
        while inner.order.len() > self.max_size {
            let oldest = inner.order.remove(0);
            inner.entries.remove(&oldest);
        }
    }

    /// Look up an outcome. Returns `None` on miss or expiry.
    pub fn get(&self, task_description: &str, language: &str) -> Option<CacheEntry> {
        let key = Self::key(task_description, language);
        let mut inner = self.lock();
        let expired = inner
            .entries
            .get(&key)
            .is_some_and(|e| e.stored_at.elapsed() > self.ttl);
        if expired {
            inner.entries.remove(&key);
            inner.order.retain(|k| k != &key);
            return None;
        }
        let entry = inner.entries.get_mut(&key)?;
        entry.hit_count += 1;
        let snapshot = entry.clone();
        inner.order.retain(|k| k != &key);
        inner.order.push(key);
        Some(snapshot)
    }

    /// Human-readable hints for the worker prompt.
    pub fn hints(&self, task_description: &str, language: &str) -> Vec<String> {
        let Some(entry) = self.get(task_description, language) else {
            return Vec::new();
        };
        match entry.outcome {
            Outcome::Success => vec![format!(
                "A similar task ({}) succeeded before. The successful pattern used:\n```\n{}\n```",
                entry.language,
                truncate_chars(&entry.code, 1024),
            )],
            Outcome::Failure => {
                let mut hints = vec![format!(
                    "A similar task ({}) failed before. Error: {}. Avoid this approach.",
                    entry.language,
                    truncate_chars(&entry.error_summary, 512),
                )];
                if !entry.code.is_empty() {
                    hints.push(format!(
                        "Failed code to avoid:\n```\n{}\n```",
                        truncate_chars(&entry.code, 512)
                    ));
                }
                hints
            }
        }
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&self, inner: &mut CacheInner) {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.stored_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.entries.remove(&key);
            inner.order.retain(|k| k != &key);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Vector-indexed failure store ───────────────────────────────────────

/// Collection holding embedded failures.
pub const FAILURES_COLLECTION: &str = "failures_v1";
/// Collection holding low-confidence retrieval queries.
pub const KNOWLEDGE_BACKLOG_COLLECTION: &str = "synesis_knowledge_backlog";

/// Long-term failure knowledge base backed by the vector store.
pub struct FailureStore {
    embeddings: Arc<dyn EmbeddingsClient>,
    store: Arc<dyn VectorStore>,
}

/// A similar past failure surfaced before generation.
#[derive(Clone, Debug)]
pub struct SimilarFailure {
    pub failure_id: String,
    pub error_type: String,
    pub error_output: String,
    pub resolution: String,
    pub score: f32,
}

impl FailureStore {
    /// Build a store over the shared clients.
    #[must_use]
    pub fn new(embeddings: Arc<dyn EmbeddingsClient>, store: Arc<dyn VectorStore>) -> Self {
        Self { embeddings, store }
    }

    /// Deterministic failure id from code and error output.
    #[must_use]
    pub fn failure_id(code: &str, error_output: &str) -> String {
        let code_head: String = code.chars().take(2048).collect();
        let err_head: String = error_output.chars().take(1024).collect();
        compact_hash(&format!("{code_head}:{err_head}"))
    }

    /// Persist a failure. Errors are logged, never propagated: the revision
    /// loop must not stall on knowledge-base writes.
    pub async fn store_failure(
        &self,
        code: &str,
        result: &SandboxResult,
        task_description: &str,
        language: &str,
    ) {
        if let Err(err) = self
            .try_store_failure(code, result, task_description, language)
            .await
        {
            warn!(%err, "failure store write skipped");
        }
    }

    async fn try_store_failure(
        &self,
        code: &str,
        result: &SandboxResult,
        task_description: &str,
        language: &str,
    ) -> Result<(), ClientError> {
        let error_output = if !result.lint.passed {
            result.lint.output.clone()
        } else if !result.security.passed {
            result.security.output.clone()
        } else {
            result.execution.output.clone()
        };
        let error_type = if result.exit_code == crate::sandbox::TIMEOUT_EXIT_CODE {
            "timeout".to_string()
        } else {
            crate::sandbox::classify_failure(result, false)
                .as_str()
                .to_string()
        };
        let failure_id = Self::failure_id(code, &error_output);
        let embedding = self
            .embeddings
            .embed(&[format!("{code}\n{error_output}")])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let record = VectorRecord {
            id: failure_id.clone(),
            embedding,
            score: None,
            fields: json!({
                "failure_id": failure_id,
                "code": truncate_chars(code, 8192),
                "error_output": truncate_chars(&error_output, 4096),
                "exit_code": result.exit_code,
                "error_type": error_type,
                "language": language,
                "task_description": truncate_chars(task_description, 2048),
                "resolution": "",
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
        };
        self.store.upsert(FAILURES_COLLECTION, vec![record]).await?;
        debug!("failure stored");
        Ok(())
    }

    /// Find failures similar to the upcoming task. Errors degrade to an
    /// empty result.
    pub async fn find_similar(&self, query: &str, top_k: usize) -> Vec<SimilarFailure> {
        let embedding = match self.embeddings.embed(&[query.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.remove(0),
            Ok(_) => return Vec::new(),
            Err(err) => {
                debug!(%err, "failure-store query skipped");
                return Vec::new();
            }
        };
        match self
            .store
            .query(FAILURES_COLLECTION, &embedding, top_k)
            .await
        {
            Ok(records) => records
                .into_iter()
                .map(|r| SimilarFailure {
                    failure_id: field_str(&r.fields, "failure_id"),
                    error_type: field_str(&r.fields, "error_type"),
                    error_output: field_str(&r.fields, "error_output"),
                    resolution: field_str(&r.fields, "resolution"),
                    score: r.score.unwrap_or(0.0),
                })
                .collect(),
            Err(err) => {
                debug!(%err, "failure-store query failed");
                Vec::new()
            }
        }
    }
}

/// Backlog of retrieval queries that came back with low confidence.
pub struct KnowledgeBacklog {
    embeddings: Arc<dyn EmbeddingsClient>,
    store: Arc<dyn VectorStore>,
}

impl KnowledgeBacklog {
    /// Build a backlog over the shared clients.
    #[must_use]
    pub fn new(embeddings: Arc<dyn EmbeddingsClient>, store: Arc<dyn VectorStore>) -> Self {
        Self { embeddings, store }
    }

    /// Record a knowledge gap. Best-effort.
    pub async fn record(&self, query: &str, top_score: f64, collections: &[String]) {
        let embedding = match self.embeddings.embed(&[query.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.remove(0),
            _ => return,
        };
        let record = VectorRecord {
            id: compact_hash(query),
            embedding,
            score: None,
            fields: json!({
                "query": truncate_chars(query, 1024),
                "top_score": top_score,
                "collections": collections,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
        };
        if let Err(err) = self
            .store
            .upsert(KNOWLEDGE_BACKLOG_COLLECTION, vec![record])
            .await
        {
            debug!(%err, "knowledge backlog write skipped");
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn field_str(fields: &serde_json::Value, key: &str) -> String {
    fields
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let cache = FailFastCache::new(10, Duration::from_secs(60));
        cache.put("sort a list", "python", Outcome::Success, "sorted(x)", "");
        let entry = cache.get("sort a list", "python").unwrap();
        assert_eq!(entry.outcome, Outcome::Success);
        assert_eq!(entry.hit_count, 1);
    }

    #[test]
    fn key_normalizes_case_and_whitespace() {
        let cache = FailFastCache::new(10, Duration::from_secs(60));
        cache.put("Sort A List ", "Python", Outcome::Failure, "", "boom");
        assert!(cache.get("sort a list", "python").is_some());
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = FailFastCache::new(2, Duration::from_secs(60));
        cache.put("a", "py", Outcome::Success, "", "");
        cache.put("b", "py", Outcome::Success, "", "");
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get("a", "py");
        cache.put("c", "py", Outcome::Success, "", "");
        assert!(cache.get("a", "py").is_some());
        assert!(cache.get("b", "py").is_none());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = FailFastCache::new(10, Duration::from_secs(0));
        cache.put("a", "py", Outcome::Success, "", "");
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a", "py").is_none());
    }

    #[test]
    fn failure_hints_mention_error() {
        let cache = FailFastCache::new(10, Duration::from_secs(60));
        cache.put(
            "parse csv",
            "python",
            Outcome::Failure,
            "open('x')",
            "FileNotFoundError",
        );
        let hints = cache.hints("parse csv", "python");
        assert_eq!(hints.len(), 2);
        assert!(hints[0].contains("FileNotFoundError"));
        assert!(hints[0].contains("Avoid"));
    }

    #[test]
    fn failure_id_is_deterministic() {
        let a = FailureStore::failure_id("code", "err");
        let b = FailureStore::failure_id("code", "err");
        assert_eq!(a, b);
        assert_ne!(a, FailureStore::failure_id("code", "other"));
    }
}
