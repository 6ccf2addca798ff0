//! Database schema definitions
//!
//! Constants for the SQLite metadata queries used by catalog introspection,
//! plus the table and column names of the built-in sample dataset.

/// SQLite catalog table
pub mod sqlite_master {
    /// User tables, internal `sqlite_` tables excluded
    pub const LIST_TABLES: &str = "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
}

/// `pragma_table_info` table-valued function
pub mod table_info {
    /// Column metadata for the bound table
    pub const QUERY: &str =
        "SELECT name, type, \"notnull\" FROM pragma_table_info(?1) ORDER BY cid";
}

/// `pragma_foreign_key_list` table-valued function
pub mod foreign_key_list {
    /// Outgoing foreign keys of the bound table
    pub const QUERY: &str = "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) \
         ORDER BY id, seq";
}

/// Connection setup applied to every pooled connection
pub mod pragmas {
    /// Refuse writes at the engine level
    pub const QUERY_ONLY: &str = "PRAGMA query_only = ON";
}

/// Sample products table
pub mod products {
    /// Table name
    pub const TABLE: &str = "Products";
    /// Primary key column
    pub const PRODUCT_ID: &str = "ProductID";
    /// Product name column
    pub const PRODUCT_NAME: &str = "ProductName";
    /// Category column
    pub const CATEGORY: &str = "Category";
    /// Unit price column
    pub const PRICE: &str = "Price";
    /// Stock count column
    pub const STOCK: &str = "Stock";
}

/// Sample orders table
pub mod orders {
    /// Table name
    pub const TABLE: &str = "Orders";
    /// Primary key column
    pub const ORDER_ID: &str = "OrderID";
    /// Customer name column
    pub const CUSTOMER_NAME: &str = "CustomerName";
    /// Order date column
    pub const ORDER_DATE: &str = "OrderDate";
    /// Order total column
    pub const TOTAL_AMOUNT: &str = "TotalAmount";
}

/// Sample order lines table
pub mod order_details {
    /// Table name
    pub const TABLE: &str = "OrderDetails";
    /// Primary key column
    pub const ORDER_DETAIL_ID: &str = "OrderDetailID";
    /// Foreign key to orders
    pub const ORDER_ID: &str = "OrderID";
    /// Foreign key to products
    pub const PRODUCT_ID: &str = "ProductID";
    /// Quantity column
    pub const QUANTITY: &str = "Quantity";
    /// Unit price column
    pub const UNIT_PRICE: &str = "UnitPrice";
}

/// DDL and rows of the sample dataset
pub const SAMPLE_SEED: &str = "
CREATE TABLE Products (
    ProductID INTEGER PRIMARY KEY,
    ProductName TEXT NOT NULL,
    Category TEXT,
    Price REAL,
    Stock INTEGER
);
CREATE TABLE Orders (
    OrderID INTEGER PRIMARY KEY,
    CustomerName TEXT NOT NULL,
    OrderDate TEXT,
    TotalAmount REAL
);
CREATE TABLE OrderDetails (
    OrderDetailID INTEGER PRIMARY KEY,
    OrderID INTEGER REFERENCES Orders(OrderID),
    ProductID INTEGER REFERENCES Products(ProductID),
    Quantity INTEGER,
    UnitPrice REAL
);
INSERT INTO Products VALUES (1, '笔记本电脑', '电子产品', 5999.00, 50);
INSERT INTO Products VALUES (2, '智能手机', '电子产品', 3999.00, 100);
INSERT INTO Products VALUES (3, '办公桌', '家具', 899.00, 20);
INSERT INTO Products VALUES (4, '办公椅', '家具', 499.00, 30);
INSERT INTO Products VALUES (5, '打印机', '办公设备', 1299.00, 15);
INSERT INTO Orders VALUES (1, '张三', '2024-01-15', 9998.00);
INSERT INTO Orders VALUES (2, '李四', '2024-01-20', 4498.00);
INSERT INTO Orders VALUES (3, '王五', '2024-02-05', 7997.00);
INSERT INTO OrderDetails VALUES (1, 1, 1, 1, 5999.00);
INSERT INTO OrderDetails VALUES (2, 1, 2, 1, 3999.00);
INSERT INTO OrderDetails VALUES (3, 2, 3, 1, 899.00);
INSERT INTO OrderDetails VALUES (4, 2, 4, 1, 499.00);
INSERT INTO OrderDetails VALUES (5, 2, 2, 1, 3999.00);
INSERT INTO OrderDetails VALUES (6, 3, 2, 2, 3999.00);
";
