//! Hybrid retrieval composed from the embedder, vector store and optional
//! reranker.
//!
//! Retrieval overfetches (`top_k * overfetch`) so the context curator has
//! material for budget trimming and retry promotion. Vector failures fall
//! back to keyword (BM25) search; a fully failed retrieval degrades to an
//! empty result so the traversal proceeds without context rather than
//! dying in the curator.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::{ClientError, EmbeddingsClient, RerankClient, VectorRecord, VectorStore};
use crate::state::{RetrievalParams, RetrievedChunk};

/// Tunables for the retrieval service.
#[derive(Clone, Debug)]
pub struct RetrievalServiceConfig {
    /// Reciprocal-rank-fusion constant.
    pub rrf_k: f64,
    /// Scores below this mark a knowledge gap.
    pub low_confidence_threshold: f64,
}

impl Default for RetrievalServiceConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            low_confidence_threshold: 0.3,
        }
    }
}

/// Retrieval facade used by the supervisor and context curator.
pub struct RetrievalService {
    embeddings: Arc<dyn EmbeddingsClient>,
    store: Arc<dyn VectorStore>,
    reranker: Option<Arc<dyn RerankClient>>,
    config: RetrievalServiceConfig,
}

impl RetrievalService {
    /// Compose the service from shared clients.
    #[must_use]
    pub fn new(
        embeddings: Arc<dyn EmbeddingsClient>,
        store: Arc<dyn VectorStore>,
        reranker: Option<Arc<dyn RerankClient>>,
        config: RetrievalServiceConfig,
    ) -> Self {
        Self {
            embeddings,
            store,
            reranker,
            config,
        }
    }

    /// Retrieve ranked chunks for `query` across `collections`.
    ///
    /// Strategy `"vector"` and `"bm25"` use a single path; `"hybrid"` fuses
    /// both with reciprocal-rank fusion. When the reranker is configured
    /// and enabled by `params`, fused candidates are rescored and the
    /// rerank score becomes the ranking score.
    pub async fn retrieve(
        &self,
        query: &str,
        collections: &[String],
        params: &RetrievalParams,
    ) -> Result<Vec<RetrievedChunk>, ClientError> {
        let fetch_k = params.top_k.saturating_mul(params.overfetch).max(params.top_k);
        let mut chunks = match params.strategy.as_str() {
            "bm25" => self.keyword_only(query, collections, fetch_k).await,
            "vector" => self.vector_only(query, collections, fetch_k).await?,
            _ => self.hybrid(query, collections, fetch_k).await?,
        };
        chunks.sort_by(|a, b| {
            b.fusion_score
                .partial_cmp(&a.fusion_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(fetch_k);

        if params.reranker != "none" {
            if let Some(reranker) = &self.reranker {
                let passages: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                match reranker.rerank(query, &passages).await {
                    Ok(scores) => {
                        for (chunk, score) in chunks.iter_mut().zip(scores) {
                            chunk.rerank_score = Some(score);
                        }
                        chunks.sort_by(|a, b| {
                            b.ranking_score()
                                .partial_cmp(&a.ranking_score())
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                    }
                    Err(err) => debug!(%err, "reranker unavailable, keeping fusion order"),
                }
            }
        }
        Ok(chunks)
    }

    /// Top ranking score of a result set, for knowledge-gap detection.
    #[must_use]
    pub fn top_score(chunks: &[RetrievedChunk]) -> f64 {
        chunks.first().map(RetrievedChunk::ranking_score).unwrap_or(0.0)
    }

    /// Whether a result set signals a knowledge gap worth backlogging.
    #[must_use]
    pub fn is_low_confidence(&self, chunks: &[RetrievedChunk]) -> bool {
        Self::top_score(chunks) < self.config.low_confidence_threshold
    }

    async fn vector_only(
        &self,
        query: &str,
        collections: &[String],
        fetch_k: usize,
    ) -> Result<Vec<RetrievedChunk>, ClientError> {
        match self.vector_search(query, collections, fetch_k).await {
            Ok(chunks) => Ok(chunks),
            Err(err) => {
                // BM25 fallback keeps retrieval alive when the vector
                // path is down.
                warn!(%err, "vector retrieval failed, falling back to BM25");
                Ok(self.keyword_only(query, collections, fetch_k).await)
            }
        }
    }

    async fn hybrid(
        &self,
        query: &str,
        collections: &[String],
        fetch_k: usize,
    ) -> Result<Vec<RetrievedChunk>, ClientError> {
        let vector = match self.vector_search(query, collections, fetch_k).await {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(%err, "vector half of hybrid failed");
                Vec::new()
            }
        };
        let keyword = self.keyword_only(query, collections, fetch_k).await;
        Ok(fuse(vector, keyword, self.config.rrf_k))
    }

    async fn vector_search(
        &self,
        query: &str,
        collections: &[String],
        fetch_k: usize,
    ) -> Result<Vec<RetrievedChunk>, ClientError> {
        let embedding = self
            .embeddings
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(ClientError::Malformed {
                service: "embedder",
                message: "empty embedding batch".into(),
            })?;
        let mut out = Vec::new();
        for collection in collections {
            let records = self.store.query(collection, &embedding, fetch_k).await?;
            out.extend(records.into_iter().map(|r| to_chunk(r, collection, true)));
        }
        Ok(out)
    }

    async fn keyword_only(
        &self,
        query: &str,
        collections: &[String],
        fetch_k: usize,
    ) -> Vec<RetrievedChunk> {
        let mut out = Vec::new();
        for collection in collections {
            match self.store.keyword_search(collection, query, fetch_k).await {
                Ok(records) => {
                    out.extend(records.into_iter().map(|r| to_chunk(r, collection, false)));
                }
                Err(err) => debug!(%err, collection, "keyword search failed"),
            }
        }
        out
    }
}

fn to_chunk(record: VectorRecord, collection: &str, vector: bool) -> RetrievedChunk {
    let text = record.fields["text"].as_str().unwrap_or_default().to_string();
    let source = record.fields["source"]
        .as_str()
        .unwrap_or(&record.id)
        .to_string();
    let score = f64::from(record.score.unwrap_or(0.0));
    RetrievedChunk {
        text,
        source,
        collection: collection.to_string(),
        vector_score: if vector { score } else { 0.0 },
        bm25_score: if vector { 0.0 } else { score },
        fusion_score: score,
        rerank_score: None,
    }
}

/// Reciprocal-rank fusion of the vector and keyword result lists.
fn fuse(vector: Vec<RetrievedChunk>, keyword: Vec<RetrievedChunk>, rrf_k: f64) -> Vec<RetrievedChunk> {
    let mut by_source: FxHashMap<String, RetrievedChunk> = FxHashMap::default();
    for (rank, chunk) in vector.into_iter().enumerate() {
        let contribution = 1.0 / (rrf_k + rank as f64 + 1.0);
        let entry = by_source.entry(chunk.source.clone()).or_insert(chunk);
        entry.fusion_score = contribution;
    }
    for (rank, chunk) in keyword.into_iter().enumerate() {
        let contribution = 1.0 / (rrf_k + rank as f64 + 1.0);
        match by_source.get_mut(&chunk.source) {
            Some(existing) => {
                existing.fusion_score += contribution;
                existing.bm25_score = chunk.bm25_score;
            }
            None => {
                let mut chunk = chunk;
                chunk.fusion_score = contribution;
                by_source.insert(chunk.source.clone(), chunk);
            }
        }
    }
    by_source.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            text: text.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    #[test]
    fn fusion_rewards_presence_in_both_lists() {
        let vector = vec![chunk("a", "alpha"), chunk("b", "beta")];
        let keyword = vec![chunk("b", "beta"), chunk("c", "gamma")];
        let mut fused = fuse(vector, keyword, 60.0);
        fused.sort_by(|x, y| y.fusion_score.partial_cmp(&x.fusion_score).unwrap());
        assert_eq!(fused[0].source, "b");
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn top_score_prefers_rerank() {
        let mut c = chunk("a", "x");
        c.fusion_score = 0.1;
        c.rerank_score = Some(0.9);
        assert!((RetrievalService::top_score(&[c]) - 0.9).abs() < f64::EPSILON);
    }
}
