use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables consulted, in order, for the completion credential
pub const API_KEY_ENV_VARS: [&str; 3] = ["DEEPSEEK_API_KEY", "DEEPSEEK_KEY", "DEEPSEEK_TOKEN"];

/// Application configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub retrieval: RetrievalConfig,
    pub schema: SchemaConfig,
    pub logging: LoggingConfig,
}

/// Which backend the pipeline runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A SQLite database file
    Live,
    /// The built-in in-memory sample dataset
    Fixture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub source: SourceKind,
    pub path: String,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub dialect: String,
    /// Masked out of logged SQL
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local feature-hashing embedder
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub dimension: usize,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: String,
    /// When false the vector store lives in a temporary directory
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Tables scoring below this are dropped before the `top_k` cut
    pub min_score: Option<f32>,
    pub include_foreign_keys: bool,
    /// Table name -> words that pin the table when they occur in the question
    pub keyword_hints: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// JSON or YAML descriptor; overlays comments onto live metadata
    pub descriptor_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Live,
            path: "data/assistant.db".to_string(),
            pool_size: 5,
            acquire_timeout_secs: 30,
            query_timeout_secs: 30,
            dialect: "sqlite".to_string(),
            password: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: None,
            timeout_secs: 60,
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            dimension: 384,
            base_url: None,
            model: None,
            timeout_secs: 30,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: "cache/schema_vectors".to_string(),
            enabled: true,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            min_score: None,
            include_foreign_keys: true,
            keyword_hints: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            format: "text".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load(explicit_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            // Start with default values
            .add_source(
                Config::try_from(&Self::default())
                    .map_err(|e| anyhow::anyhow!("Failed to encode defaults: {}", e))?,
            )
            // Add config files if they exist
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = explicit_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            // Add environment variables with prefix, e.g. SQL_ASSISTANT__DATABASE__POOL_SIZE
            .add_source(
                Environment::with_prefix("SQL_ASSISTANT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Failed to deserialize configuration: {}", e))?;

        // Validate configuration
        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate database config
        if self.database.pool_size == 0 {
            return Err(anyhow::anyhow!("pool_size must be greater than 0"));
        }
        if self.database.acquire_timeout_secs == 0 {
            return Err(anyhow::anyhow!("acquire_timeout_secs must be greater than 0"));
        }
        if self.database.query_timeout_secs == 0 {
            return Err(anyhow::anyhow!("query_timeout_secs must be greater than 0"));
        }
        let valid_dialects = ["sqlite", "generic", "mssql", "postgres", "mysql"];
        if !valid_dialects.contains(&self.database.dialect.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid dialect: {}. Must be one of: {:?}",
                self.database.dialect,
                valid_dialects
            ));
        }

        // Validate completion service config
        if self.llm.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be greater than 0"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow::anyhow!("llm timeout_secs must be greater than 0"));
        }

        // Validate embedding config
        if self.embedding.dimension == 0 {
            return Err(anyhow::anyhow!("embedding dimension must be greater than 0"));
        }
        if self.embedding.provider == EmbeddingProvider::Remote && self.embedding.base_url.is_none() {
            return Err(anyhow::anyhow!("remote embedding provider requires base_url"));
        }

        // Validate retrieval config
        if self.retrieval.top_k == 0 {
            return Err(anyhow::anyhow!("top_k must be greater than 0"));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        Ok(())
    }

    /// Resolve the completion credential once, at startup.
    ///
    /// Precedence: explicit value, then `llm.api_key`, then [`API_KEY_ENV_VARS`].
    pub fn resolve_api_key(&self, explicit: Option<&str>) -> Result<String> {
        let from_env = || {
            API_KEY_ENV_VARS
                .iter()
                .find_map(|name| std::env::var(name).ok())
        };
        explicit
            .map(ToString::to_string)
            .or_else(|| self.llm.api_key.clone())
            .or_else(from_env)
            .map(|raw| clean_api_key(&raw))
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No completion API key: pass --api-key or set {}",
                    API_KEY_ENV_VARS.join(" / ")
                )
            })
    }

    /// Per-lease acquire timeout
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.database.acquire_timeout_secs)
    }

    /// Per-statement timeout
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.database.query_timeout_secs)
    }

    /// Descriptor path, if configured
    #[must_use]
    pub fn descriptor_path(&self) -> Option<PathBuf> {
        self.schema.descriptor_path.as_ref().map(PathBuf::from)
    }
}

/// Trim whitespace and one layer of surrounding quotes
fn clean_api_key(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '"' || c == '\'').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database.source, SourceKind::Live);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AppConfig::default();
        config.database.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_api_key_wins_and_is_cleaned() {
        let mut config = AppConfig::default();
        config.llm.api_key = Some("from-config".to_string());
        let key = config.resolve_api_key(Some("  \"sk-explicit\" ")).unwrap();
        assert_eq!(key, "sk-explicit");
        assert_eq!(config.resolve_api_key(None).unwrap(), "from-config");
    }
}
