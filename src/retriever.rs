//! Ranks cached table vectors against a question.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::catalog::SchemaCatalog;
use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::EmbeddingError;
use crate::models::{SchemaVector, TableDescriptor};

/// Added to a table's score when one of its hint keywords occurs in the question
pub const KEYWORD_BOOST: f64 = 1.0;

/// A table and its relevance score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredTable {
    /// Table name
    pub name: String,
    /// Cosine similarity plus any keyword boost
    pub score: f64,
}

/// Score every vector against `query` and sort by score descending, name
/// ascending. Tables below `min_score` are dropped.
#[must_use]
pub fn rank_tables(
    query: &[f32],
    question: &str,
    vectors: &HashMap<String, SchemaVector>,
    keyword_hints: &BTreeMap<String, Vec<String>>,
    min_score: Option<f32>,
) -> Vec<ScoredTable> {
    let question_lower = question.to_lowercase();
    let mut ranked: Vec<ScoredTable> = vectors
        .iter()
        .map(|(name, vector)| {
            let mut score = cosine_similarity(query, &vector.embedding).unwrap_or(0.0);
            if hinted(name, &question_lower, keyword_hints) {
                score += KEYWORD_BOOST;
            }
            ScoredTable {
                name: name.clone(),
                score,
            }
        })
        .filter(|scored| min_score.map_or(true, |min| scored.score >= f64::from(min)))
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    ranked
}

fn hinted(table: &str, question_lower: &str, keyword_hints: &BTreeMap<String, Vec<String>>) -> bool {
    keyword_hints
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case(table))
        .flat_map(|(_, keywords)| keywords)
        .any(|keyword| !keyword.is_empty() && question_lower.contains(&keyword.to_lowercase()))
}

/// Selects the tables worth showing the generator
pub struct SchemaRetriever {
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl std::fmt::Debug for SchemaRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRetriever")
            .field("embedder", &self.embedder.id())
            .field("config", &self.config)
            .finish()
    }
}

impl SchemaRetriever {
    /// `embedder` must be the one the vectors were built with
    pub fn new(embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self { embedder, config }
    }

    /// Configured `top_k`
    #[must_use]
    pub const fn top_k(&self) -> usize {
        self.config.top_k
    }

    /// Pick at most `top_k` tables by relevance, then append the tables their
    /// foreign keys point at.
    ///
    /// Neighbours are appended in name order after the ranked tables and are
    /// not counted against `top_k`.
    pub async fn select_relevant(
        &self,
        question: &str,
        vectors: &HashMap<String, SchemaVector>,
        catalog: &SchemaCatalog,
        top_k: usize,
    ) -> Result<Vec<TableDescriptor>, EmbeddingError> {
        let query = self.embedder.embed(question).await?;
        let ranked = rank_tables(
            &query,
            question,
            vectors,
            &self.config.keyword_hints,
            self.config.min_score,
        );

        let mut selected: Vec<TableDescriptor> = ranked
            .iter()
            .filter_map(|scored| catalog.table(&scored.name))
            .take(top_k)
            .cloned()
            .collect();

        if self.config.include_foreign_keys {
            let chosen: HashSet<String> = selected.iter().map(|t| t.name.to_lowercase()).collect();
            let neighbours: BTreeSet<String> = selected
                .iter()
                .flat_map(|t| t.foreign_keys.iter())
                .filter_map(|fk| catalog.table(&fk.references_table))
                .filter(|t| !chosen.contains(&t.name.to_lowercase()))
                .map(|t| t.name.clone())
                .collect();
            selected.extend(neighbours.iter().filter_map(|name| catalog.table(name)).cloned());
        }

        debug!(
            ranked = ?ranked.iter().take(top_k).map(|s| (s.name.as_str(), s.score)).collect::<Vec<_>>(),
            selected = ?selected.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Selected tables"
        );
        Ok(selected)
    }
}
