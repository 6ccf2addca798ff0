use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::catalog::SchemaCatalog;
use crate::embedding::Embedder;
use crate::error::{CacheError, EmbeddingError};
use crate::metrics::MetricsCollector;
use crate::models::{BuildSummary, CacheEntry, SchemaVector, TableDescriptor};

const VECTOR_TREE: &str = "schema_vectors";

/// Persistent table-name -> [`CacheEntry`] map backed by sled.
///
/// Each insert replaces one key atomically, so readers never observe a
/// partially written entry.
#[derive(Debug, Clone)]
pub struct VectorStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl VectorStore {
    /// Open or create a store at `path`
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Store(sled::Error::Io(e)))?;
        }
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Store that is deleted when dropped
    pub fn temporary() -> Result<Self, CacheError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, CacheError> {
        let tree = db.open_tree(VECTOR_TREE)?;
        Ok(Self { db, tree })
    }

    /// Entry for `table`, if any
    pub fn get(&self, table: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self.tree.get(table.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace the entry for `table`
    pub fn put(&self, table: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let data = bincode::serialize(entry)?;
        self.tree.insert(table.as_bytes(), data)?;
        Ok(())
    }

    /// Remove the entry for `table`, returning true if one existed
    pub fn remove(&self, table: &str) -> Result<bool, CacheError> {
        Ok(self.tree.remove(table.as_bytes())?.is_some())
    }

    /// Names of all cached tables
    pub fn tables(&self) -> Result<Vec<String>, CacheError> {
        self.tree
            .iter()
            .keys()
            .map(|key| -> Result<String, CacheError> { Ok(String::from_utf8_lossy(&key?).into_owned()) })
            .collect()
    }

    /// Number of cached tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True if nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Persist pending writes
    pub fn flush(&self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Result of a cache pass over a catalog
#[derive(Debug)]
pub struct CacheBuild {
    /// One vector per table that has a fresh or last-known-good embedding
    pub vectors: HashMap<String, SchemaVector>,
    /// Tables with neither
    pub failures: Vec<CacheError>,
    /// Counts for reporting
    pub summary: BuildSummary,
}

enum Outcome {
    Reused(SchemaVector),
    Rebuilt(SchemaVector),
    Degraded(SchemaVector),
    Failed(CacheError),
}

/// Table-granular embedding cache.
///
/// An entry is reused only while its descriptor checksum and embedder id
/// match; anything else is recomputed. Concurrent builds of the same table
/// are serialized so the embedder runs once per table per change.
pub struct EmbeddingCache {
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("store", &self.store)
            .field("embedder", &self.embedder.id())
            .finish_non_exhaustive()
    }
}

impl EmbeddingCache {
    /// Create a cache over `store` using `embedder`
    pub fn new(store: VectorStore, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            locks: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::default(),
        }
    }

    /// Underlying store
    #[must_use]
    pub const fn store(&self) -> &VectorStore {
        &self.store
    }

    /// Return a vector for every table in `catalog`, computing only what is
    /// missing or stale. With `force`, every vector is recomputed.
    ///
    /// Entries for tables no longer in the catalog are pruned. A table whose
    /// embedding fails falls back to its previous vector, flagged degraded,
    /// and is reported in `failures` only when no previous vector exists.
    pub async fn get_or_build(&self, catalog: &SchemaCatalog, force: bool) -> Result<CacheBuild, CacheError> {
        let start = Instant::now();
        let force_started = Utc::now();
        let mut summary = BuildSummary {
            catalog_version: catalog.version().to_string(),
            ..BuildSummary::default()
        };
        let mut vectors = HashMap::with_capacity(catalog.len());
        let mut failures = Vec::new();

        for table in catalog.tables() {
            match self.vector_for(table, force, force_started).await? {
                Outcome::Reused(vector) => {
                    summary.reused += 1;
                    vectors.insert(table.name.clone(), vector);
                }
                Outcome::Rebuilt(vector) => {
                    summary.rebuilt += 1;
                    vectors.insert(table.name.clone(), vector);
                }
                Outcome::Degraded(vector) => {
                    summary.degraded += 1;
                    vectors.insert(table.name.clone(), vector);
                }
                Outcome::Failed(error) => {
                    summary.failed.push(table.name.clone());
                    failures.push(error);
                }
            }
        }

        let current: HashSet<&str> = catalog.tables().iter().map(|t| t.name.as_str()).collect();
        for cached in self.store.tables()? {
            if !current.contains(cached.as_str()) && self.store.remove(&cached)? {
                debug!(table = %cached, "Pruned cache entry for removed table");
                summary.pruned += 1;
            }
        }

        if summary.rebuilt > 0 || summary.pruned > 0 {
            self.store.flush()?;
        }

        summary.elapsed = start.elapsed();
        self.metrics.record_cache_build(&summary);
        info!(
            version = %summary.catalog_version,
            reused = summary.reused,
            rebuilt = summary.rebuilt,
            degraded = summary.degraded,
            failed = summary.failed.len(),
            pruned = summary.pruned,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Schema vector cache ready"
        );

        Ok(CacheBuild {
            vectors,
            failures,
            summary,
        })
    }

    fn lock_for(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(table.to_string()).or_default())
    }

    fn is_fresh(&self, entry: &CacheEntry, checksum: &str) -> bool {
        entry.vector.is_valid_for(checksum) && entry.embedder == self.embedder.id()
    }

    async fn vector_for(
        &self,
        table: &TableDescriptor,
        force: bool,
        force_started: DateTime<Utc>,
    ) -> Result<Outcome, CacheError> {
        let checksum = table.checksum();

        if !force {
            if let Some(entry) = self.store.get(&table.name)? {
                if self.is_fresh(&entry, &checksum) {
                    return Ok(Outcome::Reused(entry.vector));
                }
            }
        }

        let lock = self.lock_for(&table.name);
        let _guard = lock.lock().await;

        // Another build may have finished this table while we waited
        let existing = self.store.get(&table.name)?;
        if let Some(entry) = &existing {
            let fresh = self.is_fresh(entry, &checksum);
            if fresh && (!force || entry.vector.created_at >= force_started) {
                return Ok(Outcome::Reused(entry.vector.clone()));
            }
        }

        let embedded = self
            .embedder
            .embed(&table.embedding_text())
            .await
            .and_then(|embedding| {
                let expected = self.embedder.dimension();
                if embedding.len() == expected {
                    Ok(embedding)
                } else {
                    Err(EmbeddingError::Dimension {
                        expected,
                        actual: embedding.len(),
                    })
                }
            });

        match embedded {
            Ok(embedding) => {
                let vector = SchemaVector {
                    table: table.name.clone(),
                    embedding,
                    source_checksum: checksum,
                    created_at: Utc::now(),
                    degraded: false,
                };
                self.store.put(
                    &table.name,
                    &CacheEntry {
                        vector: vector.clone(),
                        embedder: self.embedder.id(),
                    },
                )?;
                debug!(table = %table.name, "Embedded table metadata");
                Ok(Outcome::Rebuilt(vector))
            }
            Err(error) => match existing {
                Some(entry) if entry.embedder == self.embedder.id() => {
                    warn!(table = %table.name, error = %error, "Embedding failed, serving previous vector");
                    let mut vector = entry.vector;
                    vector.degraded = true;
                    Ok(Outcome::Degraded(vector))
                }
                _ => {
                    warn!(table = %table.name, error = %error, "Embedding failed and no previous vector exists");
                    Ok(Outcome::Failed(CacheError::Unavailable {
                        table: table.name.clone(),
                        reason: error.to_string(),
                    }))
                }
            },
        }
    }
}
