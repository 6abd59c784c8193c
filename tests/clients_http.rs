//! Contract tests for the HTTP clients against a mock server.

use httpmock::prelude::*;
use serde_json::json;

use synesis::clients::{
    AnalysisClient, ChatModel, EmbeddingsClient, HttpAnalysisClient, HttpChatModel,
    HttpEmbeddingsClient, HttpSandboxClient, SandboxClient,
};
use synesis::message::Message;

#[tokio::test]
async fn embeddings_client_parses_the_data_envelope() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(200)
                .json_body(json!({"data": [{"embedding": [0.1, 0.2, 0.3]}]}));
        })
        .await;

    let client = HttpEmbeddingsClient::new(reqwest::Client::new(), server.base_url(), "embed");
    let vectors = client.embed(&["hello".to_string()]).await.unwrap();
    mock.assert_async().await;
    assert_eq!(vectors.len(), 1);
    assert_eq!(vectors[0].len(), 3);
}

#[tokio::test]
async fn sandbox_client_sends_the_contract_payload() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/execute")
                .header_exists("X-Synesis-Request-ID")
                .json_body_partial(
                    r#"{"language": "python", "code": "print(1)", "filename": "script.py"}"#,
                );
            then.status(200).json_body(json!({
                "exit_code": 0,
                "lint": {"passed": true, "output": ""},
                "security": {"passed": true, "output": ""},
                "execution": {"exit_code": 0, "output": "1\n"},
            }));
        })
        .await;

    let client = HttpSandboxClient::new(
        reqwest::Client::new(),
        server.base_url(),
        std::time::Duration::from_secs(10),
    );
    let result = client
        .execute("python", "print(1)", "script.py", "req-1")
        .await
        .unwrap();
    mock.assert_async().await;
    assert_eq!(result.exit_code, 0);
    assert!(result.lint.passed);
}

#[tokio::test]
async fn sandbox_client_surfaces_http_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/execute");
            then.status(503);
        })
        .await;

    let client = HttpSandboxClient::new(
        reqwest::Client::new(),
        server.base_url(),
        std::time::Duration::from_secs(10),
    );
    let err = client
        .execute("python", "print(1)", "script.py", "req-1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn analysis_client_parses_diagnostics() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/analyze");
            then.status(200).json_body(json!({
                "language": "python",
                "engine": "pyright",
                "diagnostics": [
                    {"severity": "error", "line": 3, "column": 1,
                     "message": "x is not defined", "rule": "reportUndefinedVariable",
                     "source": "pyright"}
                ],
                "analysis_time_ms": 12.5,
                "error": null,
                "skipped": false,
            }));
        })
        .await;

    let client = HttpAnalysisClient::new(reqwest::Client::new(), server.base_url());
    let report = client
        .analyze("python", "print(x)", Some("script.py"), "req-2")
        .await
        .unwrap();
    assert_eq!(report.engine, "pyright");
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].rule, "reportUndefinedVariable");
}

#[tokio::test]
async fn chat_model_extracts_the_first_choice() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"code\": \"x\"}"}}],
            }));
        })
        .await;

    let client = HttpChatModel::new(reqwest::Client::new(), server.base_url(), "synesis-worker");
    let text = client
        .complete(&[Message::user("generate")], "req-3")
        .await
        .unwrap();
    assert_eq!(text, "{\"code\": \"x\"}");
}
