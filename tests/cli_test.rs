//! Tests for the command-line binary

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use httpmock::prelude::*;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

fn reply(content: &str) -> serde_json::Value {
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

fn write_config(dir: &TempDir, server: &MockServer) -> PathBuf {
    let path = dir.path().join("cli.yaml");
    fs::write(
        &path,
        format!(
            "llm:\n  base_url: {}\n  max_attempts: 1\n  timeout_secs: 5\nlogging:\n  level: warn\n",
            server.base_url()
        ),
    )
    .unwrap();
    path
}

fn cli(config: &PathBuf) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sql-query-assistant"));
    cmd.args(["--test-mode", "--no-cache", "--api-key", "sk-test", "--config"])
        .arg(config);
    cmd
}

#[test]
fn test_answered_question_exits_zero() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200)
            .json_body(reply("SELECT ProductName FROM Products WHERE Price > 1000"));
    });
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &server);

    cli(&config)
        .args(["-q", "查询价格超过1000元的产品"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SELECT ProductName FROM Products"))
        .stdout(predicate::str::contains("=== Session ==="))
        .stdout(predicate::str::contains("requests:   1 (1 succeeded)"));
}

#[test]
fn test_rejected_question_exits_nonzero() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200).json_body(reply("DELETE FROM Products"));
    });
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &server);

    cli(&config)
        .args(["-q", "删除所有产品"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("查询失败 [validating]"))
        .stdout(predicate::str::contains("requests:   1 (0 succeeded)"));
}

#[test]
fn test_list_tables_in_test_mode() {
    let server = MockServer::start();
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &server);

    cli(&config)
        .arg("--list-tables")
        .assert()
        .success()
        .stdout(predicate::str::contains("OrderDetails"))
        .stdout(predicate::str::contains("Products"));
}
