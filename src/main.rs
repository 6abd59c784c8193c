//! Synesis service entrypoint: wire the clients, compile the graph, serve
//! the OpenAI-compatible API.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use synesis::api::{router, ApiState};
use synesis::breaker::BreakerRegistry;
use synesis::caches::{FailFastCache, FailureStore, KnowledgeBacklog};
use synesis::classifier::IntentClassifier;
use synesis::clients::{
    HttpAnalysisClient, HttpChatModel, HttpEmbeddingsClient, HttpRerankClient, HttpSandboxClient,
    HttpVectorStore, RerankClient, RetrievalService, RetrievalServiceConfig, SandboxExecutor,
};
use synesis::config::{DefaultsPolicy, Settings};
use synesis::memory::ConversationMemory;
use synesis::routing::{AnalyzerMode, Router};
use synesis::runner::Coordinator;
use synesis::stages::{build_graph, StageServices};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_error::ErrorLayer::default())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::from_env());
    tracing::info!(bind = %settings.bind_addr, model = %settings.model_id, "synesis starting");

    // One long-lived client shared across every outbound service for
    // connection pooling.
    let http = reqwest::Client::new();

    let embeddings = Arc::new(HttpEmbeddingsClient::new(
        http.clone(),
        settings.embedder_url.clone(),
        "synesis-embed",
    ));
    let vector_store = Arc::new(HttpVectorStore::new(
        http.clone(),
        settings.vector_store_url.clone(),
    ));
    let reranker: Option<Arc<dyn RerankClient>> = settings
        .reranker_url
        .as_ref()
        .map(|url| Arc::new(HttpRerankClient::new(http.clone(), url.clone())) as Arc<dyn RerankClient>);
    let retrieval = Arc::new(RetrievalService::new(
        embeddings.clone(),
        vector_store.clone(),
        reranker,
        RetrievalServiceConfig::default(),
    ));
    let warm_pool = Arc::new(HttpSandboxClient::new(
        http.clone(),
        settings.sandbox_warm_pool_url.clone(),
        settings.sandbox_timeout,
    ));
    let sandbox = Arc::new(SandboxExecutor::new(warm_pool, None));
    let analysis = Arc::new(HttpAnalysisClient::new(
        http.clone(),
        settings.analysis_gateway_url.clone(),
    ));
    let chat = Arc::new(HttpChatModel::new(
        http,
        settings.chat_model_url.clone(),
        settings.chat_model_name.clone(),
    ));

    let memory = Arc::new(ConversationMemory::new(
        settings.memory_max_turns_per_user,
        settings.memory_max_users,
        settings.memory_ttl,
        settings.pending_question_ttl,
    ));
    let policy = DefaultsPolicy::resolve(
        settings.defaults_policy_path.as_deref().map(Path::new),
        settings.project_manifest_path.as_deref().map(Path::new),
    );
    let classifier = Arc::new(IntentClassifier::from_paths(
        settings.intent_weights_path.as_deref().map(Path::new),
        settings.intent_plugins_dir.as_deref().map(Path::new),
        policy.clone(),
    ));

    let services = StageServices {
        settings: settings.clone(),
        policy,
        chat,
        retrieval,
        sandbox,
        analysis,
        failfast: Arc::new(FailFastCache::new(
            settings.failfast_max_size,
            settings.failfast_ttl,
        )),
        failure_store: Arc::new(FailureStore::new(embeddings.clone(), vector_store.clone())),
        backlog: Arc::new(KnowledgeBacklog::new(embeddings, vector_store)),
        memory: memory.clone(),
        breakers: Arc::new(BreakerRegistry::new(
            settings.breaker_failure_threshold,
            settings.breaker_reset_timeout,
        )),
        classifier,
    };

    let router_config = Router {
        analyzer_enabled: settings.lsp_enabled,
        analyzer_mode: AnalyzerMode::parse(&settings.lsp_mode),
        max_analyzer_calls: settings.max_lsp_calls,
    };
    let graph = Arc::new(build_graph(services, router_config)?);
    let coordinator = Arc::new(Coordinator::new(
        graph,
        router_config,
        memory,
        settings.clone(),
    ));

    let app = router(ApiState {
        coordinator,
        settings: settings.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
