//! Prompt construction, completion retries and statement extraction.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Location, Token, TokenWithLocation, Tokenizer};
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::CompletionError;
use crate::llm::CompletionClient;
use crate::metrics::MetricsCollector;
use crate::models::{GeneratedQuery, RejectReason, TableDescriptor, ValidationOutcome};
use crate::validation::dialect_for;

/// How completion calls are bounded and retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each further failure
    pub backoff_base: Duration,
    /// Upper bound on a single call
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy from the `llm` configuration section
    #[must_use]
    pub const fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            call_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based), with up to 50% jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.backoff_base.saturating_mul(1 << exponent);
        let jitter_ms = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Turns a question plus table context into a single SQL statement
pub struct QueryGenerator {
    client: Arc<dyn CompletionClient>,
    policy: RetryPolicy,
    dialect: String,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for QueryGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGenerator")
            .field("policy", &self.policy)
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

impl QueryGenerator {
    /// `dialect` selects both the prompt wording and the extraction tokenizer
    pub fn new(client: Arc<dyn CompletionClient>, policy: RetryPolicy, dialect: impl Into<String>) -> Self {
        Self {
            client,
            policy,
            dialect: dialect.into(),
            metrics: MetricsCollector::default(),
        }
    }

    /// Ask the completion service for a statement answering `question`.
    ///
    /// A response that does not contain exactly one statement is not an
    /// error: it comes back with `sql = None` and a `NoSingleStatement`
    /// rejection. Errors are reserved for the service itself failing.
    pub async fn generate(
        &self,
        question: &str,
        tables: &[TableDescriptor],
    ) -> Result<GeneratedQuery, CompletionError> {
        let prompt = build_prompt(question, tables, &self.dialect);
        debug!(chars = prompt.len(), tables = tables.len(), "Prompt built");

        let raw_response = self.complete_with_retry(&prompt).await?;
        let sql = extract_statement(&raw_response, &self.dialect);
        let validation = if sql.is_none() {
            warn!(response = %raw_response, "Response did not contain exactly one statement");
            Some(ValidationOutcome::Rejected(RejectReason::NoSingleStatement))
        } else {
            None
        };

        Ok(GeneratedQuery {
            question: question.to_string(),
            tables: tables.iter().map(|t| t.name.clone()).collect(),
            raw_response,
            sql,
            validation,
        })
    }

    async fn complete_with_retry(&self, prompt: &str) -> Result<String, CompletionError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(self.policy.call_timeout, self.client.complete(prompt))
                .await
                .unwrap_or(Err(CompletionError::Timeout(self.policy.call_timeout)));

            match result {
                Ok(text) => {
                    self.metrics.record_completion_attempt("ok");
                    info!(attempt, "Completion succeeded");
                    return Ok(text);
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    self.metrics.record_completion_attempt("retry");
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Completion failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    self.metrics.record_completion_attempt("failed");
                    warn!(attempt, error = %error, "Completion failed");
                    return Err(error);
                }
            }
        }
    }
}

fn dialect_label(dialect: &str) -> (&'static str, &'static str) {
    match dialect {
        "mssql" => ("SQL Server", "\"SELECT TOP N\""),
        "postgres" | "postgresql" => ("PostgreSQL", "\"LIMIT N\""),
        "mysql" => ("MySQL", "\"LIMIT N\""),
        "sqlite" => ("SQLite", "\"LIMIT N\""),
        _ => ("SQL", "\"LIMIT N\""),
    }
}

/// Render the generation prompt for `question` over `tables`
#[must_use]
pub fn build_prompt(question: &str, tables: &[TableDescriptor], dialect: &str) -> String {
    let (name, limit) = dialect_label(dialect);
    let schema = tables
        .iter()
        .map(TableDescriptor::render)
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "你是{name}专家，请将以下自然语言问题转换为SQL查询语句。\n\n\
         数据库表结构:\n{schema}\n\
         用户问题: {question}\n\n\
         请生成标准的SQL SELECT查询语句，遵循以下规则：\n\
         1. 严格使用上述schema中提供的表名和字段名\n\
         2. 只能使用SELECT语句，禁止使用任何DML语句(如INSERT/UPDATE/DELETE)\n\
         3. 禁止使用存储过程调用，不要使用EXEC或sp_前缀的函数\n\
         4. 如果需要限制结果数量，请使用{limit}语法\n\
         5. 请确保SQL语法正确且字段名匹配\n\
         6. 只返回一条SQL语句，不要使用```sql代码块标记\n\
         7. 不要包含任何解释文字\n\n\
         SQL查询:\n"
    )
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").unwrap()
    })
}

/// Pull exactly one statement out of a model response.
///
/// A single fenced block is unwrapped first; two or more fences are refused.
/// The remaining text is tokenized and split on semicolons. Exactly one
/// segment may contain tokens other than whitespace and comments, and it must
/// start with a keyword. Anything else yields `None`.
#[must_use]
pub fn extract_statement(response: &str, dialect: &str) -> Option<String> {
    let fences: Vec<_> = fence_regex().captures_iter(response).collect();
    let body = match fences.as_slice() {
        [] => response,
        [only] => only.get(1).map_or("", |m| m.as_str()),
        _ => return None,
    };

    let dialect = dialect_for(dialect);
    let tokens = Tokenizer::new(dialect.as_ref(), body)
        .tokenize_with_location()
        .ok()?;

    // Index ranges of the non-blank tokens of each semicolon-separated segment
    let mut segments: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (idx, token) in tokens.iter().enumerate() {
        match token.token {
            Token::SemiColon => {
                if let Some(segment) = current.take() {
                    segments.push(segment);
                }
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => {
                current = Some(current.map_or((idx, idx), |(start, _)| (start, idx)));
            }
        }
    }
    if let Some(segment) = current {
        segments.push(segment);
    }

    let [(first, last)] = segments.as_slice() else {
        return None;
    };
    if !matches!(&tokens[*first].token, Token::Word(word) if word.quote_style.is_none()
        && word.keyword != sqlparser::keywords::Keyword::NoKeyword)
    {
        return None;
    }

    let start = byte_offset(body, &tokens[*first]);
    let end = tokens
        .get(last + 1)
        .map_or(body.len(), |next| byte_offset(body, next));
    let statement = body.get(start..end)?.trim();
    if statement.is_empty() {
        return None;
    }

    // Trailing prose without a semicolon still lands in the segment
    match Parser::parse_sql(dialect.as_ref(), statement) {
        Ok(parsed) if parsed.len() == 1 => Some(statement.to_string()),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "Response is not a single parsable statement");
            None
        }
    }
}

/// Byte offset of a token from its 1-based line/column location
fn byte_offset(text: &str, token: &TokenWithLocation) -> usize {
    let Location { line, column } = token.location;
    let (mut cur_line, mut cur_col) = (1u64, 1u64);
    for (idx, ch) in text.char_indices() {
        if cur_line == line && cur_col == column {
            return idx;
        }
        if ch == '\n' {
            cur_line += 1;
            cur_col = 1;
        } else {
            cur_col += 1;
        }
    }
    text.len()
}
