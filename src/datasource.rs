//! Backends the pipeline can run against.
//!
//! A [`DataSource`] is chosen once at startup. `Live` opens a SQLite file
//! read-only; `Fixture` is an in-memory shared-cache database seeded from SQL
//! and kept alive by a keeper connection for as long as the fixture exists.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::config::{DatabaseConfig, SourceKind};
use crate::error::PoolError;
use crate::models::{ColumnDescriptor, TableDescriptor};
use crate::schema::{order_details, orders, pragmas, products, SAMPLE_SEED};

static FIXTURE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Where statements run
#[derive(Debug, Clone)]
pub enum DataSource {
    /// SQLite database file, opened read-only
    Live {
        /// Database file
        path: PathBuf,
    },
    /// Seeded in-memory database
    Fixture(Fixture),
}

impl DataSource {
    /// Read-only file source
    pub fn live(path: impl AsRef<Path>) -> Self {
        Self::Live {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Select the source from configuration. `test_mode` forces the sample fixture.
    pub fn from_config(config: &DatabaseConfig, test_mode: bool) -> Result<Self, PoolError> {
        if test_mode || config.source == SourceKind::Fixture {
            info!("Using in-memory sample dataset");
            return Ok(Self::Fixture(Fixture::sample()?));
        }
        info!(path = %config.path, "Using SQLite database");
        Ok(Self::live(&config.path))
    }

    /// r2d2 manager opening connections to this source.
    ///
    /// Every connection is switched to `query_only`.
    #[must_use]
    pub fn manager(&self) -> SqliteConnectionManager {
        let manager = match self {
            Self::Live { path } => SqliteConnectionManager::file(path).with_flags(
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            Self::Fixture(fixture) => {
                SqliteConnectionManager::file(fixture.uri()).with_flags(Fixture::open_flags())
            }
        };
        manager.with_init(|conn| conn.execute_batch(pragmas::QUERY_ONLY))
    }

    /// Static descriptor shipped with the source, if any
    #[must_use]
    pub fn static_tables(&self) -> Option<&[TableDescriptor]> {
        match self {
            Self::Live { .. } => None,
            Self::Fixture(fixture) => Some(fixture.tables()),
        }
    }

    /// Short description for logs
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Live { path } => format!("sqlite:{}", path.display()),
            Self::Fixture(fixture) => format!("fixture:{}", fixture.uri()),
        }
    }
}

/// In-memory dataset shared by every pooled connection
#[derive(Debug, Clone)]
pub struct Fixture {
    uri: String,
    tables: Vec<TableDescriptor>,
    // The shared-cache database lives as long as one connection to it is open
    _keeper: Arc<Mutex<Connection>>,
}

impl Fixture {
    /// Create a fresh database, run `seed_sql` in it and pair it with `tables`
    pub fn new(seed_sql: &str, tables: Vec<TableDescriptor>) -> Result<Self, PoolError> {
        let seq = FIXTURE_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!(
            "file:sqa_fixture_{}_{seq}?mode=memory&cache=shared",
            process::id()
        );
        let keeper = Connection::open_with_flags(&uri, Self::open_flags())?;
        keeper.execute_batch(seed_sql)?;
        debug!(uri = %uri, tables = tables.len(), "Seeded fixture database");

        Ok(Self {
            uri,
            tables,
            _keeper: Arc::new(Mutex::new(keeper)),
        })
    }

    /// The sample sales dataset: products, orders and order lines
    pub fn sample() -> Result<Self, PoolError> {
        Self::new(SAMPLE_SEED, sample_tables())
    }

    /// Connection URI of the shared in-memory database
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Descriptor of the seeded tables
    #[must_use]
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    fn open_flags() -> OpenFlags {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_SHARED_CACHE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    }
}

fn sample_tables() -> Vec<TableDescriptor> {
    vec![
        TableDescriptor::new(products::TABLE, "产品信息表，存储所有销售产品的详细信息")
            .with_column(ColumnDescriptor::new(products::PRODUCT_ID, "INTEGER").with_comment("产品ID，主键"))
            .with_column(ColumnDescriptor::new(products::PRODUCT_NAME, "TEXT").with_comment("产品名称"))
            .with_column(ColumnDescriptor::new(products::CATEGORY, "TEXT").with_comment("产品类别"))
            .with_column(ColumnDescriptor::new(products::PRICE, "REAL").with_comment("产品单价"))
            .with_column(ColumnDescriptor::new(products::STOCK, "INTEGER").with_comment("库存数量")),
        TableDescriptor::new(orders::TABLE, "订单信息表，存储客户订单的基本信息")
            .with_column(ColumnDescriptor::new(orders::ORDER_ID, "INTEGER").with_comment("订单ID，主键"))
            .with_column(ColumnDescriptor::new(orders::CUSTOMER_NAME, "TEXT").with_comment("客户姓名"))
            .with_column(ColumnDescriptor::new(orders::ORDER_DATE, "TEXT").with_comment("订单日期"))
            .with_column(ColumnDescriptor::new(orders::TOTAL_AMOUNT, "REAL").with_comment("订单总金额")),
        TableDescriptor::new(order_details::TABLE, "订单明细表，存储订单中包含的产品详情")
            .with_column(
                ColumnDescriptor::new(order_details::ORDER_DETAIL_ID, "INTEGER")
                    .with_comment("订单明细ID，主键"),
            )
            .with_column(
                ColumnDescriptor::new(order_details::ORDER_ID, "INTEGER")
                    .with_comment("订单ID，外键关联Orders表"),
            )
            .with_column(
                ColumnDescriptor::new(order_details::PRODUCT_ID, "INTEGER")
                    .with_comment("产品ID，外键关联Products表"),
            )
            .with_column(ColumnDescriptor::new(order_details::QUANTITY, "INTEGER").with_comment("购买数量"))
            .with_column(ColumnDescriptor::new(order_details::UNIT_PRICE, "REAL").with_comment("单价"))
            .with_foreign_key(order_details::ORDER_ID, orders::TABLE, orders::ORDER_ID)
            .with_foreign_key(order_details::PRODUCT_ID, products::TABLE, products::PRODUCT_ID),
    ]
}
