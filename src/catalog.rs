//! Schema catalog: the tables the generator may use.
//!
//! A catalog is built from a descriptor file (JSON or YAML), from live SQLite
//! metadata, or from both, with the descriptor supplying comments the database
//! cannot. It is immutable once built; reloading produces a new catalog.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use rusqlite::{params, Connection};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::CatalogError;
use crate::models::{ColumnDescriptor, ForeignKey, TableDescriptor};
use crate::schema::{foreign_key_list, sqlite_master, table_info};

/// Descriptor files hold either a bare list of tables or `{ tables: [...] }`
#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    List(Vec<TableDescriptor>),
    Wrapped { tables: Vec<TableDescriptor> },
}

impl DescriptorFile {
    fn into_tables(self) -> Vec<TableDescriptor> {
        match self {
            Self::List(tables) | Self::Wrapped { tables } => tables,
        }
    }
}

/// Versioned set of table descriptors
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    tables: Vec<TableDescriptor>,
    version: String,
}

impl SchemaCatalog {
    /// Build a catalog, rejecting duplicate table names (case-insensitive)
    pub fn new(tables: Vec<TableDescriptor>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for table in &tables {
            if !seen.insert(table.name.to_lowercase()) {
                return Err(CatalogError::DuplicateTable(table.name.clone()));
            }
        }

        let version = catalog_version(&tables);
        debug!(tables = tables.len(), version = %version, "Schema catalog built");

        Ok(Self {
            tables,
            version,
        })
    }

    /// Load tables from a JSON or YAML descriptor. The format is chosen by
    /// extension; `.yaml`/`.yml` is YAML, everything else JSON.
    pub fn from_descriptor_file(path: &Path) -> Result<Self, CatalogError> {
        Self::new(read_descriptor(path)?)
    }

    /// Read table, column and foreign-key metadata from a SQLite connection
    pub fn introspect(conn: &Connection) -> Result<Self, CatalogError> {
        Self::new(introspect_tables(conn)?)
    }

    /// Live metadata with comments taken from a descriptor file
    pub fn introspect_with_descriptor(conn: &Connection, path: &Path) -> Result<Self, CatalogError> {
        let live = introspect_tables(conn)?;
        let described = read_descriptor(path)?;
        Self::new(overlay_comments(live, &described))
    }

    /// All tables in load order
    #[must_use]
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    /// Case-insensitive table lookup
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Table names in load order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// SHA-256 over the sorted per-table checksums
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// True if the catalog has no tables
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn catalog_version(tables: &[TableDescriptor]) -> String {
    let mut entries: Vec<(String, String)> = tables
        .iter()
        .map(|t| (t.name.clone(), t.checksum()))
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for (name, checksum) in &entries {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(checksum.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

fn read_descriptor(path: &Path) -> Result<Vec<TableDescriptor>, CatalogError> {
    let text = fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    let file: DescriptorFile = if is_yaml {
        serde_yaml::from_str(&text).map_err(|e| CatalogError::Parse(e.to_string()))?
    } else {
        serde_json::from_str(&text).map_err(|e| CatalogError::Parse(e.to_string()))?
    };

    let tables = file.into_tables();
    info!(path = %path.display(), tables = tables.len(), "Loaded schema descriptor");
    Ok(tables)
}

fn introspect_tables(conn: &Connection) -> Result<Vec<TableDescriptor>, CatalogError> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare(sqlite_master::LIST_TABLES)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut column_stmt = conn.prepare(table_info::QUERY)?;
    let mut fk_stmt = conn.prepare(foreign_key_list::QUERY)?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let columns = column_stmt
            .query_map(params![name], |row| {
                let column_name: String = row.get(0)?;
                let declared: String = row.get(1)?;
                let not_null: bool = row.get(2)?;
                Ok(parse_column(column_name, &declared, !not_null))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let foreign_keys = fk_stmt
            .query_map(params![name], |row| {
                Ok(ForeignKey {
                    column: row.get(0)?,
                    references_table: row.get(1)?,
                    // NULL when the key targets the referenced table's primary key
                    references_column: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<Result<_, _>>()?;

        tables.push(TableDescriptor {
            name,
            comment: String::new(),
            columns,
            foreign_keys,
        });
    }

    debug!(tables = tables.len(), "Introspected SQLite metadata");
    Ok(tables)
}

/// Split a declared type such as `DECIMAL(10, 2)` into name, length and scale
fn parse_column(name: String, declared: &str, nullable: bool) -> ColumnDescriptor {
    let mut column = ColumnDescriptor::new(name, declared.trim());
    column.nullable = nullable;

    if let (Some(open), Some(close)) = (declared.find('('), declared.rfind(')')) {
        if open < close {
            let mut args = declared[open + 1..close]
                .split(',')
                .map(|part| part.trim().parse::<u32>().ok());
            column.data_type = declared[..open].trim().to_string();
            column.length = args.next().flatten();
            column.scale = args.next().flatten();
        }
    }
    column
}

/// Copy table and column comments from `described` onto `live`. Structure
/// always comes from the live side.
fn overlay_comments(live: Vec<TableDescriptor>, described: &[TableDescriptor]) -> Vec<TableDescriptor> {
    live.into_iter()
        .map(|mut table| {
            let Some(source) = described.iter().find(|d| d.name.eq_ignore_ascii_case(&table.name))
            else {
                return table;
            };
            if table.comment.is_empty() {
                table.comment.clone_from(&source.comment);
            }
            for column in &mut table.columns {
                if let Some(described_column) = source.column(&column.name) {
                    if column.comment.is_empty() {
                        column.comment.clone_from(&described_column.comment);
                    }
                }
            }
            table
        })
        .collect()
}
