//! Tests for the completion client and the retrying query generator

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use sql_query_assistant::error::CompletionError;
use sql_query_assistant::generator::{QueryGenerator, RetryPolicy};
use sql_query_assistant::llm::{CompletionClient, DeepSeekClient};
use sql_query_assistant::models::{ColumnDescriptor, RejectReason, TableDescriptor, ValidationOutcome};

fn client(server: &MockServer) -> DeepSeekClient {
    DeepSeekClient::new(server.base_url(), "deepseek-chat", "sk-test", Duration::from_secs(5)).unwrap()
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        call_timeout: Duration::from_secs(5),
    }
}

fn product() -> TableDescriptor {
    TableDescriptor::new("Product", "产品信息表")
        .with_column(ColumnDescriptor::new("Price", "REAL").with_comment("产品价格"))
}

fn chat_reply(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

#[tokio::test]
async fn test_completion_success() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer sk-test")
                .json_body_partial(r#"{ "model": "deepseek-chat", "stream": false }"#);
            then.status(200).json_body(chat_reply("SELECT 1"));
        })
        .await;

    let text = client(&server).complete("hello").await.unwrap();
    assert_eq!(text, "SELECT 1");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_generator_extracts_statement() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions").body_contains("Product");
            then.status(200)
                .json_body(chat_reply("```sql\nSELECT * FROM Product WHERE Price > 1000\n```"));
        })
        .await;

    let generator = QueryGenerator::new(Arc::new(client(&server)), fast_policy(), "sqlite");
    let generated = generator
        .generate("查询价格超过1000元的产品", &[product()])
        .await
        .unwrap();

    assert_eq!(generated.sql.as_deref(), Some("SELECT * FROM Product WHERE Price > 1000"));
    assert_eq!(generated.tables, ["Product"]);
    assert!(generated.validation.is_none());
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_prose_reply_has_no_statement() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(chat_reply("我无法根据现有的表回答这个问题。"));
        })
        .await;

    let generator = QueryGenerator::new(Arc::new(client(&server)), fast_policy(), "sqlite");
    let generated = generator.generate("天气如何", &[product()]).await.unwrap();
    assert!(generated.sql.is_none());
    assert_eq!(
        generated.validation,
        Some(ValidationOutcome::Rejected(RejectReason::NoSingleStatement))
    );
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401).body(r#"{"error":{"message":"invalid api key"}}"#);
        })
        .await;

    let generator = QueryGenerator::new(Arc::new(client(&server)), fast_policy(), "sqlite");
    let err = generator.generate("q", &[product()]).await.unwrap_err();
    assert!(matches!(err, CompletionError::Auth(_)));
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_quota_is_not_retried() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(402).body("Insufficient Balance");
        })
        .await;

    let generator = QueryGenerator::new(Arc::new(client(&server)), fast_policy(), "sqlite");
    let err = generator.generate("q", &[product()]).await.unwrap_err();
    assert!(matches!(err, CompletionError::Quota(_)));
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_server_errors_retry_up_to_limit() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(503).body("busy");
        })
        .await;

    let generator = QueryGenerator::new(Arc::new(client(&server)), fast_policy(), "sqlite");
    let err = generator.generate("q", &[product()]).await.unwrap_err();
    assert!(matches!(err, CompletionError::Transient(_)));
    mock.assert_hits_async(3).await;
}

#[tokio::test]
async fn test_slow_call_times_out() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .delay(Duration::from_millis(500))
                .json_body(chat_reply("SELECT 1"));
        })
        .await;

    let policy = RetryPolicy {
        max_attempts: 2,
        backoff_base: Duration::from_millis(1),
        call_timeout: Duration::from_millis(100),
    };
    let generator = QueryGenerator::new(Arc::new(client(&server)), policy, "sqlite");
    let err = generator.generate("q", &[product()]).await.unwrap_err();
    assert_eq!(err, CompletionError::Timeout(Duration::from_millis(100)));
    mock.assert_hits_async(2).await;
}

#[tokio::test]
async fn test_malformed_body_is_invalid_response() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({ "choices": [] }));
        })
        .await;

    let err = client(&server).complete("q").await.unwrap_err();
    assert!(matches!(err, CompletionError::InvalidResponse(_)));
}
