//! Shared fakes and fixtures for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use sql_query_assistant::cache::VectorStore;
use sql_query_assistant::config::{AppConfig, SourceKind};
use sql_query_assistant::datasource::{DataSource, Fixture};
use sql_query_assistant::embedding::{Embedder, HashingEmbedder};
use sql_query_assistant::error::{CompletionError, EmbeddingError};
use sql_query_assistant::llm::CompletionClient;
use sql_query_assistant::models::{ColumnDescriptor, TableDescriptor};
use sql_query_assistant::pool::ConnectionManager;
use sql_query_assistant::{Components, QueryAssistant};

/// Completion client replaying a fixed list of replies
#[derive(Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Always answers with `sql`
    pub fn always(sql: &str) -> Self {
        Self::new(vec![Ok(sql.to_string()); 16])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::InvalidResponse("script exhausted".into())))
    }
}

/// Hashing embedder that counts calls and can be switched off
pub struct CountingEmbedder {
    inner: HashingEmbedder,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl CountingEmbedder {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: HashingEmbedder::new(64),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("embedding service down".into()));
        }
        self.inner.embed(text).await
    }

    fn id(&self) -> String {
        self.inner.id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

pub fn product_table() -> TableDescriptor {
    TableDescriptor::new("Product", "产品信息表")
        .with_column(ColumnDescriptor::new("Id", "INTEGER").with_comment("产品ID"))
        .with_column(ColumnDescriptor::new("Name", "TEXT").with_comment("产品名称"))
        .with_column(ColumnDescriptor::new("Price", "REAL").with_comment("产品价格"))
}

/// `Product(Id, Name, Price)` with one row at 500 and one at 1500
pub fn product_fixture() -> Fixture {
    Fixture::new(
        "CREATE TABLE Product (Id INTEGER PRIMARY KEY, Name TEXT, Price REAL);
         INSERT INTO Product VALUES (1, '台灯', 500);
         INSERT INTO Product VALUES (2, '显示器', 1500);",
        vec![product_table()],
    )
    .unwrap()
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database.source = SourceKind::Fixture;
    config.database.pool_size = 2;
    config.database.acquire_timeout_secs = 2;
    config.database.query_timeout_secs = 5;
    config.llm.max_attempts = 3;
    config.llm.backoff_base_ms = 1;
    config.llm.timeout_secs = 5;
    config.cache.enabled = false;
    config
}

/// Assistant over `fixture` with fake completion and embedding services
pub fn assistant(
    fixture: Fixture,
    completion: Arc<ScriptedCompletion>,
    embedder: Arc<CountingEmbedder>,
) -> QueryAssistant {
    let config = test_config();
    let pool = ConnectionManager::new(
        DataSource::Fixture(fixture),
        config.database.pool_size,
        config.acquire_timeout(),
    )
    .unwrap();

    QueryAssistant::with_components(
        &config,
        Components {
            pool,
            store: VectorStore::temporary().unwrap(),
            embedder,
            completion,
        },
    )
    .unwrap()
}
