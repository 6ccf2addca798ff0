//! Tests for loading the schema catalog from descriptors and live metadata

use std::fs;

use rusqlite::Connection;
use sql_query_assistant::catalog::SchemaCatalog;
use sql_query_assistant::error::CatalogError;
use sql_query_assistant::models::TableDescriptor;
use tempfile::TempDir;

const JSON_DESCRIPTOR: &str = r#"{
  "tables": [
    {
      "name": "Product",
      "comment": "产品信息表",
      "columns": [
        { "name": "Id", "type": "INTEGER", "nullable": false, "comment": "产品ID" },
        { "name": "Name", "type": "NVARCHAR", "length": "100", "comment": "产品名称" },
        { "name": "Price", "type": "DECIMAL", "length": 10, "scale": 2, "comment": "产品价格" }
      ]
    },
    {
      "name": "OrderLine",
      "columns": [
        { "name": "ProductId", "type": "INTEGER", "length": "" }
      ],
      "foreign_keys": [
        { "column": "ProductId", "references_table": "Product", "references_column": "Id" }
      ]
    }
  ]
}"#;

const YAML_DESCRIPTOR: &str = r"
- name: Product
  comment: 产品信息表
  columns:
    - name: Id
      type: INTEGER
    - name: Price
      type: REAL
      comment: 产品价格
";

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_json_descriptor() {
    let dir = TempDir::new().unwrap();
    let catalog = SchemaCatalog::from_descriptor_file(&write(&dir, "schema.json", JSON_DESCRIPTOR)).unwrap();

    assert_eq!(catalog.len(), 2);
    let product = catalog.table("product").unwrap();
    assert_eq!(product.comment, "产品信息表");
    assert_eq!(product.columns.len(), 3);

    let id = product.column("Id").unwrap();
    assert!(!id.nullable);
    let name = product.column("Name").unwrap();
    assert_eq!(name.type_label(), "NVARCHAR(100)");
    let price = product.column("Price").unwrap();
    assert_eq!(price.type_label(), "DECIMAL(10,2)");

    let line = catalog.table("OrderLine").unwrap();
    assert_eq!(line.columns[0].length, None);
    assert_eq!(line.foreign_keys.len(), 1);
}

#[test]
fn test_load_yaml_descriptor() {
    let dir = TempDir::new().unwrap();
    let catalog = SchemaCatalog::from_descriptor_file(&write(&dir, "schema.yaml", YAML_DESCRIPTOR)).unwrap();

    assert_eq!(catalog.names(), vec!["Product".to_string()]);
    let product = catalog.table("Product").unwrap();
    assert_eq!(product.column("Price").unwrap().comment, "产品价格");
    assert!(product.column("Id").unwrap().nullable);
}

#[test]
fn test_missing_descriptor_file() {
    let dir = TempDir::new().unwrap();
    let result = SchemaCatalog::from_descriptor_file(&dir.path().join("missing.json"));
    assert!(matches!(result, Err(CatalogError::Read { .. })));
}

#[test]
fn test_malformed_descriptor() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "schema.json", r#"{ "tables": "nope" }"#);
    assert!(matches!(
        SchemaCatalog::from_descriptor_file(&path),
        Err(CatalogError::Parse(_))
    ));
}

#[test]
fn test_duplicate_tables_rejected() {
    let result = SchemaCatalog::new(vec![
        TableDescriptor::new("Product", ""),
        TableDescriptor::new("PRODUCT", ""),
    ]);
    assert!(matches!(result, Err(CatalogError::DuplicateTable(_))));
}

#[test]
fn test_introspect_sqlite_metadata() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE Product (Id INTEGER PRIMARY KEY, Name TEXT NOT NULL, Price DECIMAL(10, 2));
         CREATE TABLE OrderLine (
             Id INTEGER PRIMARY KEY,
             ProductId INTEGER REFERENCES Product(Id),
             Quantity INTEGER
         );",
    )
    .unwrap();

    let catalog = SchemaCatalog::introspect(&conn).unwrap();
    assert_eq!(catalog.len(), 2);

    let product = catalog.table("Product").unwrap();
    let names: Vec<&str> = product.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["Id", "Name", "Price"]);
    assert!(!product.column("Name").unwrap().nullable);
    assert_eq!(product.column("Price").unwrap().type_label(), "DECIMAL(10,2)");

    let line = catalog.table("OrderLine").unwrap();
    let fk = line.foreign_keys.iter().next().unwrap();
    assert_eq!(fk.column, "ProductId");
    assert_eq!(fk.references_table, "Product");
    assert_eq!(fk.references_column, "Id");
}

#[test]
fn test_introspect_with_descriptor_comments() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "schema.yml", YAML_DESCRIPTOR);

    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("CREATE TABLE Product (Id INTEGER, Price REAL, Stock INTEGER);")
        .unwrap();

    let catalog = SchemaCatalog::introspect_with_descriptor(&conn, &path).unwrap();
    let product = catalog.table("Product").unwrap();
    assert_eq!(product.comment, "产品信息表");
    assert_eq!(product.column("Price").unwrap().comment, "产品价格");
    // Live structure wins
    assert_eq!(product.columns.len(), 3);
    assert!(product.column("Stock").unwrap().comment.is_empty());
}

#[test]
fn test_version_tracks_metadata() {
    let a = SchemaCatalog::new(vec![TableDescriptor::new("Product", "产品")]).unwrap();
    let b = SchemaCatalog::new(vec![TableDescriptor::new("Product", "产品")]).unwrap();
    let c = SchemaCatalog::new(vec![TableDescriptor::new("Product", "产品目录")]).unwrap();

    assert_eq!(a.version(), b.version());
    assert_ne!(a.version(), c.version());
}
