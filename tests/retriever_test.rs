//! Tests for table ranking and foreign-key expansion

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use proptest::prelude::*;
use sql_query_assistant::catalog::SchemaCatalog;
use sql_query_assistant::config::RetrievalConfig;
use sql_query_assistant::embedding::HashingEmbedder;
use sql_query_assistant::models::{ColumnDescriptor, SchemaVector, TableDescriptor};
use sql_query_assistant::retriever::{rank_tables, SchemaRetriever, ScoredTable, KEYWORD_BOOST};

fn sales_catalog() -> SchemaCatalog {
    SchemaCatalog::new(vec![
        TableDescriptor::new("Products", "产品信息表")
            .with_column(ColumnDescriptor::new("ProductID", "INTEGER"))
            .with_column(ColumnDescriptor::new("Price", "REAL").with_comment("产品单价")),
        TableDescriptor::new("Orders", "订单信息表")
            .with_column(ColumnDescriptor::new("OrderID", "INTEGER"))
            .with_column(ColumnDescriptor::new("CustomerName", "TEXT").with_comment("客户姓名")),
        TableDescriptor::new("OrderDetails", "订单明细表")
            .with_column(ColumnDescriptor::new("OrderID", "INTEGER"))
            .with_column(ColumnDescriptor::new("ProductID", "INTEGER"))
            .with_column(ColumnDescriptor::new("Quantity", "INTEGER").with_comment("购买数量"))
            .with_foreign_key("OrderID", "Orders", "OrderID")
            .with_foreign_key("ProductID", "Products", "ProductID"),
        TableDescriptor::new("Employees", "员工信息表")
            .with_column(ColumnDescriptor::new("EmployeeID", "INTEGER"))
            .with_column(ColumnDescriptor::new("Salary", "REAL").with_comment("工资")),
    ])
    .unwrap()
}

fn vectors_for(catalog: &SchemaCatalog, embedder: &HashingEmbedder) -> HashMap<String, SchemaVector> {
    catalog
        .tables()
        .iter()
        .map(|table| {
            (
                table.name.clone(),
                SchemaVector {
                    table: table.name.clone(),
                    embedding: embedder.embed_text(&table.embedding_text()),
                    source_checksum: table.checksum(),
                    created_at: Utc::now(),
                    degraded: false,
                },
            )
        })
        .collect()
}

fn retriever(config: RetrievalConfig) -> (SchemaRetriever, HashingEmbedder) {
    let embedder = HashingEmbedder::new(256);
    (SchemaRetriever::new(Arc::new(embedder.clone()), config), embedder)
}

#[tokio::test]
async fn test_foreign_key_neighbours_are_appended() {
    let catalog = sales_catalog();
    let mut config = RetrievalConfig::default();
    config.keyword_hints = BTreeMap::from([("OrderDetails".to_string(), vec!["明细".to_string()])]);
    let (retriever, embedder) = retriever(config);
    let vectors = vectors_for(&catalog, &embedder);

    let selected = retriever
        .select_relevant("订单明细里的购买数量", &vectors, &catalog, 1)
        .await
        .unwrap();

    let names: Vec<&str> = selected.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["OrderDetails", "Orders", "Products"]);
}

#[tokio::test]
async fn test_foreign_key_expansion_can_be_disabled() {
    let catalog = sales_catalog();
    let mut config = RetrievalConfig::default();
    config.include_foreign_keys = false;
    config.keyword_hints = BTreeMap::from([("OrderDetails".to_string(), vec!["明细".to_string()])]);
    let (retriever, embedder) = retriever(config);
    let vectors = vectors_for(&catalog, &embedder);

    let selected = retriever
        .select_relevant("订单明细", &vectors, &catalog, 1)
        .await
        .unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].name, "OrderDetails");
}

#[tokio::test]
async fn test_neighbour_already_selected_is_not_repeated() {
    let catalog = sales_catalog();
    let mut config = RetrievalConfig::default();
    config.keyword_hints = BTreeMap::from([
        ("OrderDetails".to_string(), vec!["明细".to_string()]),
        ("Orders".to_string(), vec!["明细".to_string()]),
    ]);
    let (retriever, embedder) = retriever(config);
    let vectors = vectors_for(&catalog, &embedder);

    let selected = retriever
        .select_relevant("订单明细", &vectors, &catalog, 2)
        .await
        .unwrap();
    let names: Vec<&str> = selected.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names.len(), 3);
    assert_eq!(names.iter().filter(|n| **n == "Orders").count(), 1);
    assert_eq!(names[2], "Products");
}

#[test]
fn test_keyword_hint_adds_boost() {
    let catalog = sales_catalog();
    let embedder = HashingEmbedder::new(256);
    let vectors = vectors_for(&catalog, &embedder);
    let query = embedder.embed_text("工资最高的员工");
    let hints = BTreeMap::from([("Products".to_string(), vec!["工资".to_string()])]);

    let plain = rank_tables(&query, "工资最高的员工", &vectors, &BTreeMap::new(), None);
    let boosted = rank_tables(&query, "工资最高的员工", &vectors, &hints, None);
    let score_of = |ranked: &[ScoredTable]| {
        ranked.iter().find(|s| s.name == "Products").map(|s| s.score).unwrap()
    };
    assert!((score_of(&boosted) - score_of(&plain) - KEYWORD_BOOST).abs() < 1e-9);
}

#[test]
fn test_min_score_filters_tables() {
    let catalog = sales_catalog();
    let embedder = HashingEmbedder::new(256);
    let vectors = vectors_for(&catalog, &embedder);
    let query = embedder.embed_text("订单");

    let ranked = rank_tables(&query, "订单", &vectors, &BTreeMap::new(), Some(2.0));
    assert!(ranked.is_empty());
}

#[test]
fn test_equal_scores_break_ties_by_name() {
    let vectors: HashMap<String, SchemaVector> = ["b", "a", "c"]
        .iter()
        .map(|name| {
            (
                name.to_string(),
                SchemaVector {
                    table: name.to_string(),
                    embedding: vec![1.0, 0.0],
                    source_checksum: String::new(),
                    created_at: Utc::now(),
                    degraded: false,
                },
            )
        })
        .collect();

    let ranked = rank_tables(&[1.0, 0.0], "q", &vectors, &BTreeMap::new(), None);
    let names: Vec<&str> = ranked.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["a", "b", "c"]);
}

proptest! {
    #[test]
    fn prop_ranking_is_deterministic(question in "[a-z\\u4e00-\\u4e2f ]{1,30}") {
        let catalog = sales_catalog();
        let embedder = HashingEmbedder::new(128);
        let vectors = vectors_for(&catalog, &embedder);
        let query = embedder.embed_text(&question);

        let first = rank_tables(&query, &question, &vectors, &BTreeMap::new(), None);
        let second = rank_tables(&query, &question, &vectors, &BTreeMap::new(), None);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_selection_is_bounded(question in "[a-z\\u4e00-\\u4e2f ]{1,30}", top_k in 1usize..5) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let catalog = sales_catalog();
        let (retriever, embedder) = retriever(RetrievalConfig::default());
        let vectors = vectors_for(&catalog, &embedder);

        let selected = runtime
            .block_on(retriever.select_relevant(&question, &vectors, &catalog, top_k))
            .unwrap();

        // At most top_k ranked tables plus their two-table neighbourhood
        prop_assert!(selected.len() <= (top_k + 2).min(catalog.len()));
        prop_assert!(!selected.is_empty());
        let mut names: Vec<&str> = selected.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        prop_assert_eq!(names.len(), selected.len());
    }
}
