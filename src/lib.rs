//! SQL Query Assistant - natural-language questions over a relational database
//!
//! A Rust library that turns a question into one read-only SQL statement,
//! runs it and returns the rows with per-stage timings.
//!
//! # Features
//!
//! - Schema catalog from SQLite metadata or JSON/YAML descriptors
//! - Table-granular embedding cache persisted in sled
//! - Relevance ranking with foreign-key expansion
//! - Completion client with bounded retries
//! - Read-only statement gate backed by a SQL parser
//! - Bounded connection pool with per-statement timeouts

/// Schema vector cache
pub mod cache;
/// Schema catalog loading
pub mod catalog;
/// Configuration management
pub mod config;
/// Live and fixture data sources
pub mod datasource;
/// Text embedders
pub mod embedding;
/// Error types
pub mod error;
/// Statement execution
pub mod executor;
/// Prompting and statement extraction
pub mod generator;
/// Completion service client
pub mod llm;
/// Logging setup and utilities
pub mod logging;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Connection pooling
pub mod pool;
/// Table relevance ranking
pub mod retriever;
/// Database schema definitions
pub mod schema;
/// The question-answering pipeline
pub mod service;
/// Input and statement validation
pub mod validation;

// Re-export key components for easier access
pub use config::AppConfig;
pub use error::{AssistantError, ErrorKind, QueryError};
pub use models::{ExecutionResult, RequestState, TableDescriptor};
pub use service::{Components, QueryAssistant};
