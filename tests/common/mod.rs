//! Shared test harness: deterministic stub clients and a services builder.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use synesis::breaker::BreakerRegistry;
use synesis::caches::{FailFastCache, FailureStore, KnowledgeBacklog};
use synesis::classifier::{builtin_fallback, IntentClassifier};
use synesis::clients::{
    AnalysisClient, AnalysisReport, ChatModel, ClientError, EmbeddingsClient, RetrievalService,
    RetrievalServiceConfig, SandboxClient, SandboxExecutor, VectorRecord, VectorStore,
};
use synesis::config::{DefaultsPolicy, Settings};
use synesis::memory::ConversationMemory;
use synesis::message::Message;
use synesis::sandbox::{ExecutionSection, LintSection, SandboxResult, SecuritySection};
use synesis::stages::StageServices;

/// Chat stub: scripted responses consumed in order, prompts recorded.
#[derive(Default)]
pub struct ScriptedChat {
    responses: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedChat {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, index: usize) -> String {
        self.prompts.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(
        &self,
        messages: &[Message],
        _request_id: &str,
    ) -> Result<String, ClientError> {
        let flattened: String = messages
            .iter()
            .map(|m| format!("[{}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(flattened);
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "{}".to_string()))
    }
}

/// Sandbox stub: scripted results consumed in order; defaults to success.
#[derive(Default)]
pub struct ScriptedSandbox {
    results: Mutex<VecDeque<SandboxResult>>,
    pub executions: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<SandboxResult>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into_iter().collect()),
            executions: Mutex::new(Vec::new()),
        })
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

#[async_trait]
impl SandboxClient for ScriptedSandbox {
    async fn execute(
        &self,
        _language: &str,
        code: &str,
        _filename: &str,
        _request_id: &str,
    ) -> Result<SandboxResult, ClientError> {
        self.executions.lock().unwrap().push(code.to_string());
        Ok(self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(success_result))
    }
}

pub struct StubAnalysis;

#[async_trait]
impl AnalysisClient for StubAnalysis {
    async fn analyze(
        &self,
        language: &str,
        _code: &str,
        _filename: Option<&str>,
        _request_id: &str,
    ) -> Result<AnalysisReport, ClientError> {
        Ok(AnalysisReport {
            language: language.to_string(),
            engine: "stub".into(),
            ..Default::default()
        })
    }
}

pub struct StubEmbeddings;

#[async_trait]
impl EmbeddingsClient for StubEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClientError> {
        Ok(texts.iter().map(|_| vec![0.0f32; 8]).collect())
    }
}

/// Vector store stub: preloadable keyword results, upserts recorded.
#[derive(Default)]
pub struct StubVectorStore {
    pub records: Mutex<Vec<VectorRecord>>,
    pub upserts: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl VectorStore for StubVectorStore {
    async fn upsert(
        &self,
        collection: &str,
        records: Vec<VectorRecord>,
    ) -> Result<(), ClientError> {
        self.upserts
            .lock()
            .unwrap()
            .push((collection.to_string(), records.len()));
        Ok(())
    }

    async fn query(
        &self,
        _collection: &str,
        _embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorRecord>, ClientError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .take(top_k)
            .cloned()
            .collect())
    }

    async fn keyword_search(
        &self,
        _collection: &str,
        _query: &str,
        top_k: usize,
    ) -> Result<Vec<VectorRecord>, ClientError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .take(top_k)
            .cloned()
            .collect())
    }
}

pub fn success_result() -> SandboxResult {
    SandboxResult {
        exit_code: 0,
        lint: LintSection::default(),
        security: SecuritySection::default(),
        execution: ExecutionSection {
            exit_code: 0,
            output: "Hello, world!\n".into(),
        },
        error: None,
    }
}

pub fn runtime_failure(output: &str) -> SandboxResult {
    SandboxResult {
        exit_code: 1,
        lint: LintSection::default(),
        security: SecuritySection::default(),
        execution: ExecutionSection {
            exit_code: 1,
            output: output.into(),
        },
        error: None,
    }
}

pub fn lint_failure(rule: &str) -> SandboxResult {
    SandboxResult {
        exit_code: 1,
        lint: LintSection {
            passed: false,
            output: format!("{rule}: style violation"),
            diagnostics: vec![synesis::sandbox::Diagnostic {
                rule: rule.into(),
                message: "style violation".into(),
                ..Default::default()
            }],
        },
        security: SecuritySection::default(),
        execution: ExecutionSection::default(),
        error: None,
    }
}

/// Full services wiring over the stubs.
pub struct TestHarness {
    pub services: StageServices,
    pub chat: Arc<ScriptedChat>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub memory: Arc<ConversationMemory>,
    pub settings: Arc<Settings>,
}

pub fn harness(chat: Arc<ScriptedChat>, sandbox: Arc<ScriptedSandbox>) -> TestHarness {
    let settings = Arc::new(Settings::from_env());
    let embeddings: Arc<dyn EmbeddingsClient> = Arc::new(StubEmbeddings);
    let store: Arc<dyn VectorStore> = Arc::new(StubVectorStore::default());
    let retrieval = Arc::new(RetrievalService::new(
        embeddings.clone(),
        store.clone(),
        None,
        RetrievalServiceConfig::default(),
    ));
    let memory = Arc::new(ConversationMemory::new(
        20,
        100,
        std::time::Duration::from_secs(3600),
        std::time::Duration::from_secs(1800),
    ));
    let services = StageServices {
        settings: settings.clone(),
        policy: DefaultsPolicy::default(),
        chat: chat.clone(),
        retrieval,
        sandbox: Arc::new(SandboxExecutor::new(sandbox.clone(), None)),
        analysis: Arc::new(StubAnalysis),
        failfast: Arc::new(FailFastCache::new(100, std::time::Duration::from_secs(600))),
        failure_store: Arc::new(FailureStore::new(embeddings.clone(), store.clone())),
        backlog: Arc::new(KnowledgeBacklog::new(embeddings, store)),
        memory: memory.clone(),
        breakers: Arc::new(BreakerRegistry::new(3, std::time::Duration::from_secs(30))),
        classifier: Arc::new(IntentClassifier::new(
            builtin_fallback(),
            DefaultsPolicy::default(),
        )),
    };
    TestHarness {
        services,
        chat,
        sandbox,
        memory,
        settings,
    }
}
