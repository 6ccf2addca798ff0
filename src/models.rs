//! Data models shared by the catalog, cache, generator and executor.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// Column metadata as described by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Declared SQL type
    #[serde(rename = "type", alias = "data_type")]
    pub data_type: String,
    /// Declared length, when the type has one
    #[serde(default, deserialize_with = "lenient_u32")]
    pub length: Option<u32>,
    /// Numeric scale, when the type has one
    #[serde(default, deserialize_with = "lenient_u32")]
    pub scale: Option<u32>,
    /// True if the column accepts NULL
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Human-readable description
    #[serde(default)]
    pub comment: String,
}

const fn default_nullable() -> bool {
    true
}

/// Descriptor files in the wild carry lengths as numbers, numeric strings or "".
fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Raw::Text(s)) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl ColumnDescriptor {
    /// Create a nullable column with no length, scale or comment
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            length: None,
            scale: None,
            nullable: true,
            comment: String::new(),
        }
    }

    /// Attach a comment
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Render the declared type including length and scale, e.g. `DECIMAL(10,2)`
    #[must_use]
    pub fn type_label(&self) -> String {
        match (self.length, self.scale) {
            (Some(len), Some(scale)) => format!("{}({len},{scale})", self.data_type),
            (Some(len), None) => format!("{}({len})", self.data_type),
            _ => self.data_type.clone(),
        }
    }
}

/// A foreign-key relation from a column of the owning table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Source column in the owning table
    pub column: String,
    /// Referenced table
    pub references_table: String,
    /// Referenced column
    pub references_column: String,
}

/// Table metadata. Immutable for a given catalog version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub comment: String,
    /// Columns in declaration order
    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,
    /// Foreign-key relations
    #[serde(default)]
    pub foreign_keys: BTreeSet<ForeignKey>,
}

impl TableDescriptor {
    /// Create a table without columns
    pub fn new(name: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comment: comment.into(),
            columns: Vec::new(),
            foreign_keys: BTreeSet::new(),
        }
    }

    /// Append a column
    #[must_use]
    pub fn with_column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a foreign key
    #[must_use]
    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.insert(ForeignKey {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
        });
        self
    }

    /// Case-insensitive column lookup
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// SHA-256 over the serialized descriptor.
    ///
    /// Columns keep declaration order and foreign keys are a sorted set, so two
    /// descriptors with the same metadata always hash the same.
    #[must_use]
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        // Serializing a plain struct cannot fail
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Text fed to the embedder for this table
    #[must_use]
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![self.name.clone()];
        if !self.comment.is_empty() {
            parts.push(self.comment.clone());
        }
        for column in &self.columns {
            parts.push(column.name.clone());
            if !column.comment.is_empty() {
                parts.push(column.comment.clone());
            }
        }
        parts.join(" ")
    }

    /// Compact rendering used inside the generation prompt
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("Table: {}\n", self.name);
        if !self.comment.is_empty() {
            out.push_str(&format!("Description: {}\n", self.comment));
        }
        out.push_str("Columns:\n");
        for column in &self.columns {
            let comment = if column.comment.is_empty() {
                "no description"
            } else {
                column.comment.as_str()
            };
            let null = if column.nullable { "" } else { ", NOT NULL" };
            out.push_str(&format!(
                "- {}: {} ({}{})\n",
                column.name,
                comment,
                column.type_label(),
                null
            ));
        }
        if !self.foreign_keys.is_empty() {
            out.push_str("Foreign keys:\n");
            for fk in &self.foreign_keys {
                out.push_str(&format!(
                    "- {}.{} -> {}.{}\n",
                    self.name, fk.column, fk.references_table, fk.references_column
                ));
            }
        }
        out
    }
}

/// Embedding of one table's metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVector {
    /// Table the vector was derived from
    pub table: String,
    /// Fixed-length embedding
    pub embedding: Vec<f32>,
    /// Checksum of the descriptor the embedding was computed from
    pub source_checksum: String,
    /// When the embedding was computed
    pub created_at: DateTime<Utc>,
    /// True when served from a stale entry because the embedder was unavailable
    #[serde(default)]
    pub degraded: bool,
}

impl SchemaVector {
    /// A vector is only valid for the descriptor checksum it was built from
    #[must_use]
    pub fn is_valid_for(&self, checksum: &str) -> bool {
        self.source_checksum == checksum
    }
}

/// Persisted form of a [`SchemaVector`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached vector
    pub vector: SchemaVector,
    /// Identifier of the embedder that produced the vector
    pub embedder: String,
}

/// Counts reported by a cache build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    /// Version hash of the catalog that was built
    pub catalog_version: String,
    /// Tables whose cached vector was reused
    pub reused: usize,
    /// Tables whose vector was recomputed
    pub rebuilt: usize,
    /// Tables served from a stale vector because embedding failed
    pub degraded: usize,
    /// Tables with no usable vector
    pub failed: Vec<String>,
    /// Entries removed because their table left the catalog
    pub pruned: usize,
    /// Wall time of the build
    pub elapsed: Duration,
}

/// Why the statement gate refused a statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// The model response did not yield exactly one statement
    NoSingleStatement,
    /// The statement is empty
    Empty,
    /// More than one statement was supplied
    MultipleStatements,
    /// A data-modification or data-definition keyword was found
    NotReadOnly(String),
    /// `SELECT ... INTO` creates a table
    SelectInto,
    /// The statement does not parse
    Unparsable(String),
    /// A referenced table is not in the catalog
    UnknownTable(String),
    /// A referenced column is not in any referenced table
    UnknownColumn(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSingleStatement => write!(f, "no single statement"),
            Self::Empty => write!(f, "empty statement"),
            Self::MultipleStatements => write!(f, "multiple statements"),
            Self::NotReadOnly(keyword) => write!(f, "not read-only: {keyword}"),
            Self::SelectInto => write!(f, "not read-only: SELECT INTO"),
            Self::Unparsable(msg) => write!(f, "unparsable: {msg}"),
            Self::UnknownTable(name) => write!(f, "unknown table: {name}"),
            Self::UnknownColumn(name) => write!(f, "unknown column: {name}"),
        }
    }
}

/// Result of the statement gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ValidationOutcome {
    /// Statement may run as-is
    Accepted,
    /// Statement must not run
    Rejected(RejectReason),
}

impl ValidationOutcome {
    /// True for [`ValidationOutcome::Accepted`]
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Output of the query generator for one question
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuery {
    /// The user's question
    pub question: String,
    /// Tables rendered into the prompt
    pub tables: Vec<String>,
    /// Text returned by the completion service
    pub raw_response: String,
    /// The single extracted statement, if any
    pub sql: Option<String>,
    /// Set to a `NoSingleStatement` rejection when extraction fails; the
    /// validator's verdict is reported on the request result instead
    pub validation: Option<ValidationOutcome>,
}

/// A value read from a result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Real(f64),
    /// Text value
    Text(String),
    /// Binary value
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Numeric view of the value, if it has one
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// One result row as ordered `(column, value)` pairs
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Row {
    /// Column/value pairs in select-list order
    pub values: Vec<(String, SqlValue)>,
}

impl Row {
    /// Case-insensitive lookup by column name
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }
}

/// Request lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RequestState {
    /// Question accepted by the pipeline
    Received,
    /// Ranking tables
    Retrieving,
    /// Waiting for the completion service
    Generating,
    /// Running the statement gate
    Validating,
    /// Running the statement
    Executing,
    /// Rows returned
    Succeeded,
    /// Refused before execution
    Rejected,
    /// Failed at some stage
    Failed,
}

impl RequestState {
    /// Terminal states accept no further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Rejected | Self::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A recorded state change
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    /// State entered
    pub state: RequestState,
    /// Wall-clock time of the transition
    pub at: DateTime<Utc>,
    /// Offset from the start of the request
    pub offset: Duration,
}

/// Ordered record of a request's state transitions
#[derive(Debug, Clone, Serialize)]
pub struct RequestTrace {
    transitions: Vec<StateTransition>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl RequestTrace {
    /// Start a trace in [`RequestState::Received`]
    #[must_use]
    pub fn start() -> Self {
        Self {
            transitions: vec![StateTransition {
                state: RequestState::Received,
                at: Utc::now(),
                offset: Duration::ZERO,
            }],
            started: Some(Instant::now()),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.transitions
            .last()
            .map_or(RequestState::Received, |t| t.state)
    }

    /// Move to `next`. Returns false, recording nothing, for backward moves
    /// or moves out of a terminal state.
    pub fn advance(&mut self, next: RequestState) -> bool {
        let current = self.state();
        if current.is_terminal() || next <= current {
            return false;
        }
        self.transitions.push(StateTransition {
            state: next,
            at: Utc::now(),
            offset: self.elapsed(),
        });
        true
    }

    /// Time since the trace started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// Recorded transitions in order
    #[must_use]
    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }
}

/// Elapsed time per pipeline stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    /// Schema retrieval
    pub retrieval: Duration,
    /// Completion call(s) and extraction
    pub generation: Duration,
    /// Statement gate
    pub validation: Duration,
    /// Lease acquisition and statement execution
    pub execution: Duration,
}

impl StageTimings {
    /// Sum of all stages
    #[must_use]
    pub fn total(&self) -> Duration {
        self.retrieval + self.generation + self.validation + self.execution
    }
}

/// Structured result of a successful request
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// The user's question
    pub question: String,
    /// The statement that ran
    pub sql: String,
    /// Tables given to the generator
    pub tables: Vec<String>,
    /// Result column names in select-list order
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Number of rows
    pub row_count: usize,
    /// Per-stage timings
    pub timings: StageTimings,
    /// Terminal state, always [`RequestState::Succeeded`] here
    pub status: RequestState,
    /// State transitions
    pub trace: RequestTrace,
}

impl ExecutionResult {
    /// Human-readable timing report
    #[must_use]
    pub fn performance_report(&self) -> String {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let mut out = String::from("=== Performance ===\n");
        out.push_str(&format!("retrieval:  {:>9.2} ms\n", ms(self.timings.retrieval)));
        out.push_str(&format!("generation: {:>9.2} ms\n", ms(self.timings.generation)));
        out.push_str(&format!("validation: {:>9.2} ms\n", ms(self.timings.validation)));
        out.push_str(&format!("execution:  {:>9.2} ms\n", ms(self.timings.execution)));
        out.push_str(&format!("total:      {:>9.2} ms\n", ms(self.timings.total())));
        out.push_str(&format!("rows:       {}\n", self.row_count));
        for transition in self.trace.transitions() {
            out.push_str(&format!(
                "  {:<10} +{:.2} ms\n",
                transition.state.to_string(),
                ms(transition.offset)
            ));
        }
        out
    }
}

/// Requests kept in the session history
pub const RECENT_REQUESTS: usize = 5;

/// One finished request, successful or not
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    /// The question as asked
    pub question: String,
    /// Terminal state
    pub status: RequestState,
    /// Stage reached when the request ended
    pub stage: RequestState,
    /// Failure description, if any
    pub error: Option<String>,
    /// Rows returned on success
    pub row_count: usize,
    /// Per-stage timings of the stages that completed
    pub timings: StageTimings,
    /// Wall time from receipt to the terminal state
    pub elapsed: Duration,
    /// When the request finished
    pub finished_at: DateTime<Utc>,
}

/// Running statistics for one assistant instance
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// When the assistant was created
    pub started_at: DateTime<Utc>,
    /// Time taken to set the assistant up
    pub init_time: Duration,
    /// Most recent cache build
    pub last_build: Option<BuildSummary>,
    /// Requests seen
    pub requests: usize,
    /// Requests that returned rows
    pub succeeded: usize,
    pub(crate) total_elapsed: Duration,
    pub(crate) total_generation: Duration,
    pub(crate) total_validation: Duration,
    pub(crate) recent: VecDeque<RequestRecord>,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            init_time: Duration::ZERO,
            last_build: None,
            requests: 0,
            succeeded: 0,
            total_elapsed: Duration::ZERO,
            total_generation: Duration::ZERO,
            total_validation: Duration::ZERO,
            recent: VecDeque::with_capacity(RECENT_REQUESTS),
        }
    }
}

impl SessionStats {
    /// Add a finished request, dropping the oldest beyond [`RECENT_REQUESTS`]
    pub fn record(&mut self, record: RequestRecord) {
        self.requests += 1;
        if record.status == RequestState::Succeeded {
            self.succeeded += 1;
        }
        self.total_elapsed += record.elapsed;
        self.total_generation += record.timings.generation;
        self.total_validation += record.timings.validation;

        if self.recent.len() == RECENT_REQUESTS {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
    }

    /// Latest requests, oldest first
    pub fn recent(&self) -> impl Iterator<Item = &RequestRecord> {
        self.recent.iter()
    }

    fn average(&self, total: Duration) -> Duration {
        u32::try_from(self.requests)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| total / n)
    }

    /// Mean wall time per request
    #[must_use]
    pub fn average_elapsed(&self) -> Duration {
        self.average(self.total_elapsed)
    }

    /// Mean time spent in generation per request
    #[must_use]
    pub fn average_generation(&self) -> Duration {
        self.average(self.total_generation)
    }

    /// Mean time spent in validation per request
    #[must_use]
    pub fn average_validation(&self) -> Duration {
        self.average(self.total_validation)
    }

    /// Human-readable session summary
    #[must_use]
    pub fn report(&self) -> String {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let mut out = String::from("=== Session ===\n");
        out.push_str(&format!("started:    {}\n", self.started_at.format("%Y-%m-%d %H:%M:%S")));
        out.push_str(&format!("init:       {:>9.2} ms\n", ms(self.init_time)));
        match &self.last_build {
            Some(build) => out.push_str(&format!(
                "vectors:    {} from cache, {} embedded, {} degraded, {} failed\n",
                build.reused,
                build.rebuilt,
                build.degraded,
                build.failed.len()
            )),
            None => out.push_str("vectors:    not built yet\n"),
        }
        out.push_str(&format!("requests:   {} ({} succeeded)\n", self.requests, self.succeeded));
        if self.requests == 0 {
            return out;
        }

        out.push_str(&format!("avg total:      {:>9.2} ms\n", ms(self.average_elapsed())));
        out.push_str(&format!("avg generation: {:>9.2} ms\n", ms(self.average_generation())));
        out.push_str(&format!("avg validation: {:>9.2} ms\n", ms(self.average_validation())));
        out.push_str("recent:\n");
        for record in &self.recent {
            let question: String = record.question.chars().take(40).collect();
            match &record.error {
                None => out.push_str(&format!(
                    "  [{}] {question} -> {} rows, {:.2} ms\n",
                    record.status,
                    record.row_count,
                    ms(record.elapsed)
                )),
                Some(error) => out.push_str(&format!(
                    "  [{}] {question} -> {} at {}, {:.2} ms\n",
                    record.status,
                    error,
                    record.stage,
                    ms(record.elapsed)
                )),
            }
        }
        out
    }
}
