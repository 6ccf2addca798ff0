use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use anyhow::{anyhow, Result};
use sqlparser::ast::{
    Expr, ObjectName, Query, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::{Dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::debug;

use crate::catalog::SchemaCatalog;
use crate::models::{RejectReason, ValidationOutcome};

/// Longest question accepted, in characters
pub const MAX_QUESTION_CHARS: usize = 2000;

/// Unquoted words that make a statement something other than a read
const FORBIDDEN_KEYWORDS: [&str; 18] = [
    "INSERT", "UPDATE", "DELETE", "MERGE", "DROP", "CREATE", "ALTER", "TRUNCATE", "REPLACE", "GRANT",
    "REVOKE", "EXEC", "EXECUTE", "CALL", "ATTACH", "DETACH", "PRAGMA", "VACUUM",
];

/// Procedure prefixes (SQL Server system and extended procedures)
const FORBIDDEN_PREFIXES: [&str; 2] = ["SP_", "XP_"];

/// Bare identifiers that are values, not columns
const BUILTIN_IDENTIFIERS: [&str; 7] = [
    "CURRENT_DATE",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "TRUE",
    "FALSE",
    "NULL",
    "ROWID",
];

/// sqlparser dialect for a configured dialect name
#[must_use]
pub fn dialect_for(name: &str) -> Box<dyn Dialect> {
    match name {
        "sqlite" => Box::new(SQLiteDialect {}),
        "mssql" => Box::new(MsSqlDialect {}),
        "postgres" | "postgresql" => Box::new(PostgreSqlDialect {}),
        "mysql" => Box::new(MySqlDialect {}),
        _ => Box::new(GenericDialect {}),
    }
}

/// Validation utilities for caller input
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a natural-language question before it enters the pipeline
    pub fn validate_question(question: &str) -> Result<()> {
        if question.trim().is_empty() {
            return Err(anyhow!("Question cannot be empty"));
        }

        if question.chars().count() > MAX_QUESTION_CHARS {
            return Err(anyhow!("Question too long (max {MAX_QUESTION_CHARS} characters)"));
        }

        // Line breaks and tabs are fine; other control characters are not
        if question
            .chars()
            .any(|c| c.is_control() && c != '\n' && c != '\t' && c != '\r')
        {
            return Err(anyhow!("Question contains invalid characters"));
        }

        Ok(())
    }
}

/// Read-only gate in front of the executor.
///
/// Accepts exactly one query statement whose tables and columns all exist in
/// the catalog. Accepted SQL is never rewritten.
#[derive(Debug, Clone)]
pub struct StatementValidator {
    dialect: String,
}

impl StatementValidator {
    /// Validator parsing with the named dialect
    pub fn new(dialect: impl Into<String>) -> Self {
        Self {
            dialect: dialect.into(),
        }
    }

    /// Check `sql` against `catalog`
    #[must_use]
    pub fn validate(&self, sql: &str, catalog: &SchemaCatalog) -> ValidationOutcome {
        match self.check(sql, catalog) {
            Ok(()) => ValidationOutcome::Accepted,
            Err(reason) => {
                debug!(reason = %reason, "Statement rejected");
                ValidationOutcome::Rejected(reason)
            }
        }
    }

    fn check(&self, sql: &str, catalog: &SchemaCatalog) -> std::result::Result<(), RejectReason> {
        if sql.trim().is_empty() {
            return Err(RejectReason::Empty);
        }

        let dialect = dialect_for(&self.dialect);
        scan_forbidden(dialect.as_ref(), sql)?;

        let statements = Parser::parse_sql(dialect.as_ref(), sql)
            .map_err(|e| RejectReason::Unparsable(e.to_string()))?;
        let statement = match statements.as_slice() {
            [] => return Err(RejectReason::Empty),
            [only] => only,
            _ => return Err(RejectReason::MultipleStatements),
        };
        if !matches!(statement, Statement::Query(_)) {
            return Err(RejectReason::NotReadOnly(statement_kind(sql)));
        }

        let mut refs = References::default();
        // The collector never breaks
        let _ = statement.visit(&mut refs);

        if refs.select_into {
            return Err(RejectReason::SelectInto);
        }
        refs.check_against(catalog)
    }
}

/// First word of the statement, for the rejection message
fn statement_kind(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .map_or_else(|| "statement".to_string(), str::to_uppercase)
}

/// Look for forbidden words outside string literals, quoted identifiers and comments
fn scan_forbidden(dialect: &dyn Dialect, sql: &str) -> std::result::Result<(), RejectReason> {
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize()
        .map_err(|e| RejectReason::Unparsable(e.to_string()))?;

    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    for (idx, token) in significant.iter().enumerate() {
        let Token::Word(word) = token else { continue };
        if word.quote_style.is_some() {
            continue;
        }
        let upper = word.value.to_uppercase();

        // replace(x, y, z) is a string function
        let is_call = matches!(significant.get(idx + 1), Some(Token::LParen));
        if upper == "REPLACE" && is_call {
            continue;
        }
        if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
            return Err(RejectReason::NotReadOnly(upper));
        }
        if FORBIDDEN_PREFIXES.iter().any(|prefix| upper.starts_with(prefix)) {
            return Err(RejectReason::NotReadOnly(word.value.clone()));
        }
    }
    Ok(())
}

/// Names a query refers to, gathered in one AST walk
#[derive(Debug, Default)]
struct References {
    relations: Vec<String>,
    ctes: HashSet<String>,
    /// alias -> table it names
    table_aliases: HashMap<String, String>,
    /// Aliases of subqueries in FROM
    derived_aliases: HashSet<String>,
    /// Output names defined by the statement itself
    output_aliases: HashSet<String>,
    columns: Vec<(Option<String>, String)>,
    select_into: bool,
}

impl References {
    fn walk_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.select_into = true;
                }
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.output_aliases.insert(alias.value.to_lowercase());
                    }
                }
                for from in &select.from {
                    self.walk_from(from);
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.walk_set_expr(left);
                self.walk_set_expr(right);
            }
            SetExpr::Query(query) => self.walk_set_expr(&query.body),
            _ => {}
        }
    }

    fn walk_from(&mut self, from: &TableWithJoins) {
        self.walk_factor(&from.relation);
        for join in &from.joins {
            self.walk_factor(&join.relation);
        }
    }

    fn walk_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                if let (Some(alias), Some(table)) = (alias, name.0.last()) {
                    self.table_aliases
                        .insert(alias.name.value.to_lowercase(), table.value.clone());
                }
            }
            TableFactor::Derived { alias: Some(alias), .. } => {
                self.derived_aliases.insert(alias.name.value.to_lowercase());
                self.output_aliases
                    .extend(alias.columns.iter().map(|c| c.value.to_lowercase()));
            }
            TableFactor::NestedJoin { table_with_joins, .. } => self.walk_from(table_with_joins),
            _ => {}
        }
    }

    fn is_local_source(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.ctes.contains(&lower) || self.derived_aliases.contains(&lower)
    }

    fn check_against(&self, catalog: &SchemaCatalog) -> std::result::Result<(), RejectReason> {
        let mut referenced = Vec::new();
        for relation in &self.relations {
            if self.ctes.contains(&relation.to_lowercase()) {
                continue;
            }
            let table = catalog
                .table(relation)
                .ok_or_else(|| RejectReason::UnknownTable(relation.clone()))?;
            referenced.push(table);
        }

        for (qualifier, column) in &self.columns {
            let lower = column.to_lowercase();
            match qualifier {
                Some(qualifier) if self.is_local_source(qualifier) => {}
                Some(qualifier) => {
                    let table_name = self
                        .table_aliases
                        .get(&qualifier.to_lowercase())
                        .map_or(qualifier.as_str(), String::as_str);
                    // Alias over a CTE
                    if self.is_local_source(table_name) {
                        continue;
                    }
                    let table = referenced
                        .iter()
                        .find(|t| t.name.eq_ignore_ascii_case(table_name))
                        .ok_or_else(|| RejectReason::UnknownTable(qualifier.clone()))?;
                    if table.column(column).is_none() {
                        return Err(RejectReason::UnknownColumn(format!("{qualifier}.{column}")));
                    }
                }
                None => {
                    let known = self.output_aliases.contains(&lower)
                        || BUILTIN_IDENTIFIERS.contains(&column.to_uppercase().as_str())
                        || referenced.iter().any(|t| t.column(column).is_some());
                    if !known {
                        return Err(RejectReason::UnknownColumn(column.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
                self.output_aliases
                    .extend(cte.alias.columns.iter().map(|c| c.value.to_lowercase()));
            }
        }
        self.walk_set_expr(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(last) = relation.0.last() {
            self.relations.push(last.value.clone());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push((None, ident.value.clone())),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let column = parts[parts.len() - 1].value.clone();
                let qualifier = parts[parts.len() - 2].value.clone();
                self.columns.push((Some(qualifier), column));
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
