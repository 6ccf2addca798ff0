//! The question-answering pipeline and the operations callers use.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;

use tracing::{error, info, warn};

use crate::cache::{EmbeddingCache, VectorStore};
use crate::catalog::SchemaCatalog;
use crate::config::AppConfig;
use crate::datasource::DataSource;
use crate::embedding::{self, Embedder};
use crate::error::{AssistantError, ErrorKind, ExecutionError, QueryError, Result};
use crate::executor;
use crate::generator::{QueryGenerator, RetryPolicy};
use crate::llm::{CompletionClient, DeepSeekClient};
use crate::logging::{mask_secret, StageTimer};
use crate::metrics::MetricsCollector;
use crate::models::{
    BuildSummary, ExecutionResult, RequestRecord, RequestState, RequestTrace, SessionStats, StageTimings,
    ValidationOutcome,
};
use crate::pool::{ConnectionManager, PoolStatus};
use crate::retriever::SchemaRetriever;
use crate::validation::{InputValidator, StatementValidator};

/// Externally built parts of a [`QueryAssistant`]
pub struct Components {
    /// Connection pool over the chosen data source
    pub pool: ConnectionManager,
    /// Persistent vector store
    pub store: VectorStore,
    /// Embedder for tables and questions
    pub embedder: Arc<dyn Embedder>,
    /// Completion service client
    pub completion: Arc<dyn CompletionClient>,
}

/// Answers natural-language questions with rows from the database.
///
/// The catalog is swapped wholesale on refresh; the cache and the pool
/// synchronize themselves. No lock is held across pipeline stages.
pub struct QueryAssistant {
    catalog: RwLock<Arc<SchemaCatalog>>,
    cache: EmbeddingCache,
    retriever: SchemaRetriever,
    generator: QueryGenerator,
    validator: StatementValidator,
    pool: ConnectionManager,
    descriptor_path: Option<PathBuf>,
    acquire_timeout: Duration,
    query_timeout: Duration,
    password: Option<String>,
    metrics: MetricsCollector,
    stats: Mutex<SessionStats>,
}

impl std::fmt::Debug for QueryAssistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryAssistant")
            .field("pool", &self.pool)
            .field("cache", &self.cache)
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

impl QueryAssistant {
    /// Build every component from configuration.
    ///
    /// `api_key` must already be resolved; nothing reads the environment
    /// after this point. `test_mode` selects the sample fixture.
    pub fn from_config(config: &AppConfig, api_key: String, test_mode: bool) -> Result<Self> {
        let started = Instant::now();
        let source = DataSource::from_config(&config.database, test_mode)?;
        let pool = ConnectionManager::new(source, config.database.pool_size, config.acquire_timeout())?;

        let store = if config.cache.enabled {
            VectorStore::open(std::path::Path::new(&config.cache.path))?
        } else {
            VectorStore::temporary()?
        };

        let embedder: Arc<dyn Embedder> = Arc::from(
            embedding::from_config(&config.embedding).map_err(|e| AssistantError::InvalidConfig(e.to_string()))?,
        );
        let completion = DeepSeekClient::from_config(&config.llm, api_key)
            .map_err(|e| AssistantError::InvalidConfig(e.to_string()))?;

        let assistant = Self::with_components(
            config,
            Components {
                pool,
                store,
                embedder,
                completion: Arc::new(completion),
            },
        )?;
        assistant.lock_stats().init_time = started.elapsed();
        Ok(assistant)
    }

    /// Assemble the pipeline from prepared components and load the catalog
    pub fn with_components(config: &AppConfig, components: Components) -> Result<Self> {
        let started = Instant::now();
        let Components {
            pool,
            store,
            embedder,
            completion,
        } = components;

        let descriptor_path = config.descriptor_path();
        let catalog = load_catalog(&pool, descriptor_path.as_deref(), config.acquire_timeout())?;
        info!(
            source = %pool.source().label(),
            tables = catalog.len(),
            version = %catalog.version(),
            "Schema catalog loaded"
        );

        Ok(Self {
            catalog: RwLock::new(Arc::new(catalog)),
            cache: EmbeddingCache::new(store, Arc::clone(&embedder)),
            retriever: SchemaRetriever::new(embedder, config.retrieval.clone()),
            generator: QueryGenerator::new(completion, RetryPolicy::from_config(&config.llm), &config.database.dialect),
            validator: StatementValidator::new(&config.database.dialect),
            pool,
            descriptor_path,
            acquire_timeout: config.acquire_timeout(),
            query_timeout: config.query_timeout(),
            password: config.database.password.clone(),
            metrics: MetricsCollector::default(),
            stats: Mutex::new(SessionStats {
                init_time: started.elapsed(),
                ..SessionStats::default()
            }),
        })
    }

    /// Current catalog
    #[must_use]
    pub fn catalog(&self) -> Arc<SchemaCatalog> {
        Arc::clone(&self.catalog.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Names of the tables in the current catalog
    #[must_use]
    pub fn list_tables(&self) -> Vec<String> {
        self.catalog().names()
    }

    /// Pool usage snapshot
    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        let status = self.pool.status();
        self.metrics.update_pool(&status);
        status
    }

    /// Bring the vector cache up to date with the catalog. With `force`,
    /// every table is re-embedded.
    pub async fn rebuild_cache(&self, force: bool) -> Result<BuildSummary> {
        let catalog = self.catalog();
        let build = self.cache.get_or_build(&catalog, force).await?;
        for failure in &build.failures {
            warn!(error = %failure, "Table left without a vector");
        }
        self.lock_stats().last_build = Some(build.summary.clone());
        Ok(build.summary)
    }

    /// Snapshot of the session statistics
    #[must_use]
    pub fn session_stats(&self) -> SessionStats {
        self.lock_stats().clone()
    }

    /// Session summary: setup time, vector origin, averages and the latest
    /// requests including failures
    #[must_use]
    pub fn performance_report(&self) -> String {
        self.lock_stats().report()
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, SessionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload the catalog from its source and replace the current one.
    /// Returns the new catalog version.
    pub fn refresh_catalog(&self) -> Result<String> {
        let fresh = load_catalog(&self.pool, self.descriptor_path.as_deref(), self.acquire_timeout)?;
        let version = fresh.version().to_string();

        let mut current = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        if current.version() != version {
            info!(old = %current.version(), new = %version, tables = fresh.len(), "Schema catalog replaced");
        }
        *current = Arc::new(fresh);
        Ok(version)
    }

    /// Answer `question`: retrieve tables, generate a statement, gate it and
    /// run it.
    ///
    /// Failures carry the stage they happened in and the time spent so far.
    /// A statement that fails the gate is never executed.
    pub async fn answer(&self, question: &str) -> std::result::Result<ExecutionResult, QueryError> {
        let mut trace = RequestTrace::start();
        let mut timings = StageTimings::default();

        if let Err(e) = InputValidator::validate_question(question) {
            return Err(self.fail(question, trace, &timings, ErrorKind::InvalidQuestion(e.to_string()), None));
        }
        let question = question.trim();
        info!(question = %question, "Answering question");

        // Retrieval
        trace.advance(RequestState::Retrieving);
        let catalog = self.catalog();
        let timer = StageTimer::start("retrieval");
        let build = match self.cache.get_or_build(&catalog, false).await {
            Ok(build) => build,
            Err(e) => return Err(self.fail(question, trace, &timings, ErrorKind::CacheUnavailable(e.to_string()), None)),
        };
        self.lock_stats().last_build = Some(build.summary.clone());
        if build.vectors.is_empty() && !catalog.is_empty() {
            let reasons = build
                .failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(self.fail(question, trace, &timings, ErrorKind::CacheUnavailable(reasons), None));
        }
        let tables = match self
            .retriever
            .select_relevant(question, &build.vectors, &catalog, self.retriever.top_k())
            .await
        {
            Ok(tables) => tables,
            Err(e) => return Err(self.fail(question, trace, &timings, ErrorKind::CacheUnavailable(e.to_string()), None)),
        };
        timings.retrieval = timer.finish();
        self.metrics.record_stage("retrieval", timings.retrieval);

        // Generation
        trace.advance(RequestState::Generating);
        let timer = StageTimer::start("generation");
        let generated = match self.generator.generate(question, &tables).await {
            Ok(generated) => generated,
            Err(e) => return Err(self.fail(question, trace, &timings, ErrorKind::GenerationServiceError(e.to_string()), None)),
        };
        timings.generation = timer.finish();
        self.metrics.record_stage("generation", timings.generation);
        let Some(sql) = generated.sql else {
            return Err(self.fail(question, trace, &timings, ErrorKind::NoSingleStatement, None));
        };

        // Validation
        trace.advance(RequestState::Validating);
        let timer = StageTimer::start("validation");
        let outcome = self.validator.validate(&sql, &catalog);
        timings.validation = timer.finish();
        self.metrics.record_stage("validation", timings.validation);
        if let ValidationOutcome::Rejected(reason) = outcome {
            return Err(self.fail(question, trace, &timings, ErrorKind::ValidationRejected(reason), Some(sql)));
        }

        // Execution
        trace.advance(RequestState::Executing);
        let timer = StageTimer::start("execution");
        let pool = self.pool.clone();
        let acquire_timeout = self.acquire_timeout;
        let lease = match tokio::task::spawn_blocking(move || pool.acquire(acquire_timeout)).await {
            Ok(Ok(lease)) => lease,
            Ok(Err(e)) => {
                self.metrics.record_pool_timeout();
                return Err(self.fail(question, trace, &timings, ErrorKind::PoolExhausted(e.to_string()), Some(sql)));
            }
            Err(e) => return Err(self.fail(question, trace, &timings, ErrorKind::ExecutionFailed(e.to_string()), Some(sql))),
        };
        let rows = match executor::execute(&sql, lease, self.query_timeout).await {
            Ok(rows) => rows,
            Err(ExecutionError::Timeout(limit)) => {
                return Err(self.fail(question, trace, &timings, ErrorKind::ExecutionTimeout(limit), Some(sql)))
            }
            Err(ExecutionError::Failed(message)) => {
                return Err(self.fail(question, trace, &timings, ErrorKind::ExecutionFailed(message), Some(sql)))
            }
        };
        timings.execution = timer.finish();
        self.metrics.record_stage("execution", timings.execution);

        trace.advance(RequestState::Succeeded);
        self.metrics.record_request(RequestState::Succeeded);
        info!(
            sql = %mask_secret(&sql, self.password.as_deref()),
            rows = rows.rows.len(),
            total_ms = timings.total().as_millis() as u64,
            "Question answered"
        );

        self.lock_stats().record(RequestRecord {
            question: question.to_string(),
            status: RequestState::Succeeded,
            stage: RequestState::Succeeded,
            error: None,
            row_count: rows.rows.len(),
            timings,
            elapsed: trace.elapsed(),
            finished_at: Utc::now(),
        });

        Ok(ExecutionResult {
            question: question.to_string(),
            sql,
            tables: generated.tables,
            row_count: rows.rows.len(),
            columns: rows.columns,
            rows: rows.rows,
            timings,
            status: RequestState::Succeeded,
            trace,
        })
    }

    /// Close the trace in the terminal state implied by `kind` and wrap it up
    fn fail(
        &self,
        question: &str,
        trace: RequestTrace,
        timings: &StageTimings,
        kind: ErrorKind,
        sql: Option<String>,
    ) -> QueryError {
        let mut err = QueryError {
            stage: trace.state(),
            elapsed: trace.elapsed(),
            kind,
            sql,
            trace,
        };
        let terminal = err.terminal_state();
        err.trace.advance(terminal);

        let masked = err.sql.as_deref().map(|s| mask_secret(s, self.password.as_deref()));
        if err.is_rejection() {
            warn!(stage = %err.stage, sql = ?masked, error = %err.kind, "Question rejected");
        } else {
            error!(stage = %err.stage, sql = ?masked, error = %err.kind, "Question failed");
        }
        self.metrics.record_request(terminal);
        self.metrics.record_error(error_type(&err.kind), err.stage);
        self.lock_stats().record(RequestRecord {
            question: question.trim().to_string(),
            status: terminal,
            stage: err.stage,
            error: Some(err.kind.to_string()),
            row_count: 0,
            timings: *timings,
            elapsed: err.elapsed,
            finished_at: Utc::now(),
        });
        err
    }
}

const fn error_type(kind: &ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidQuestion(_) => "invalid_question",
        ErrorKind::CacheUnavailable(_) => "cache_unavailable",
        ErrorKind::GenerationServiceError(_) => "generation_service",
        ErrorKind::NoSingleStatement => "no_single_statement",
        ErrorKind::ValidationRejected(_) => "validation_rejected",
        ErrorKind::PoolExhausted(_) => "pool_exhausted",
        ErrorKind::ExecutionTimeout(_) => "execution_timeout",
        ErrorKind::ExecutionFailed(_) => "execution_failed",
    }
}

/// Load the catalog for the pool's source.
///
/// A fixture ships its own descriptor. A live database is introspected, with
/// comments overlaid from the descriptor file when one is configured.
pub fn load_catalog(
    pool: &ConnectionManager,
    descriptor: Option<&std::path::Path>,
    acquire_timeout: Duration,
) -> Result<SchemaCatalog> {
    if let Some(tables) = pool.source().static_tables() {
        return Ok(SchemaCatalog::new(tables.to_vec())?);
    }

    let lease = pool.acquire(acquire_timeout)?;
    let catalog = match descriptor {
        Some(path) => SchemaCatalog::introspect_with_descriptor(&lease, path)?,
        None => SchemaCatalog::introspect(&lease)?,
    };
    pool.release(lease);

    if catalog.is_empty() {
        return Err(AssistantError::Other(format!(
            "No tables found in {}",
            pool.source().label()
        )));
    }
    Ok(catalog)
}
