//! Static inspection of passthrough SQL
//!
//! `search_sql` needs the tables and functions a statement touches before
//! running it. [`ParsedSqlIntrospector`] gets them from the `sqlparser` AST;
//! callers with stricter needs can plug in their own [`SqlIntrospector`].

use std::collections::HashSet;
use std::ops::ControlFlow;

use sqlparser::ast::{Expr, Ident, ObjectName, ObjectNamePart, Query, TableFactor, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{DatastoreError, Result};

/// Names referenced by a statement, in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlReferences {
    /// Relations read, schema-qualified when written that way
    pub tables: Vec<String>,
    /// Functions called, without schema
    pub functions: Vec<String>,
}

/// Extracts what a passthrough statement touches
pub trait SqlIntrospector: Send + Sync {
    fn is_single_statement(&self, sql: &str) -> Result<bool>;

    fn referenced_names(&self, sql: &str) -> Result<SqlReferences>;
}

/// [`SqlIntrospector`] backed by the PostgreSQL dialect of `sqlparser`
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedSqlIntrospector;

impl ParsedSqlIntrospector {
    fn parse(sql: &str) -> Result<Vec<sqlparser::ast::Statement>> {
        Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|e| DatastoreError::malformed(e.to_string()))
    }
}

impl SqlIntrospector for ParsedSqlIntrospector {
    fn is_single_statement(&self, sql: &str) -> Result<bool> {
        Ok(Self::parse(sql)?.len() == 1)
    }

    fn referenced_names(&self, sql: &str) -> Result<SqlReferences> {
        let statements = Self::parse(sql)?;
        let mut collector = NameCollector::default();
        for statement in &statements {
            let _ = statement.visit(&mut collector);
        }
        Ok(collector.into_references())
    }
}

#[derive(Default)]
struct NameCollector {
    ctes: HashSet<String>,
    tables: Vec<String>,
    functions: Vec<String>,
}

impl NameCollector {
    fn add_table(&mut self, name: &ObjectName) {
        let parts = name_parts(name);
        if parts.len() == 1 && self.ctes.contains(&parts[0]) {
            return;
        }
        let full = parts.join(".");
        if !full.is_empty() && !self.tables.contains(&full) {
            self.tables.push(full);
        }
    }

    fn add_function(&mut self, name: &ObjectName) {
        if let Some(last) = name_parts(name).pop() {
            self.add_function_name(&last);
        }
    }

    fn add_function_name(&mut self, name: &str) {
        if !self.functions.iter().any(|f| f == name) {
            self.functions.push(name.to_string());
        }
    }

    fn into_references(self) -> SqlReferences {
        SqlReferences {
            tables: self.tables,
            functions: self.functions,
        }
    }
}

impl Visitor for NameCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(normalize(&cte.alias.name));
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            TableFactor::Table {
                name, args: Some(_), ..
            } => self.add_function(name),
            TableFactor::Table { name, .. } => self.add_table(name),
            TableFactor::Function { name, .. } => self.add_function(name),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        // Keyword forms parse to dedicated nodes, not Expr::Function,
        // but still call the engine function of the same name.
        match expr {
            Expr::Function(function) => self.add_function(&function.name),
            Expr::Substring { .. } => self.add_function_name("substring"),
            Expr::Trim { .. } => self.add_function_name("trim"),
            Expr::Position { .. } => self.add_function_name("position"),
            Expr::Extract { .. } => self.add_function_name("extract"),
            Expr::Overlay { .. } => self.add_function_name("overlay"),
            Expr::Ceil { .. } => self.add_function_name("ceil"),
            Expr::Floor { .. } => self.add_function_name("floor"),
            Expr::AtTimeZone { .. } => self.add_function_name("timezone"),
            Expr::Convert { .. } => self.add_function_name("convert"),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Unquoted identifiers fold to lower case, as the engine does
fn normalize(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

#[allow(unreachable_patterns)]
fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(normalize(ident)),
            _ => None,
        })
        .collect()
}

/// Whether a referenced relation lives in the engine's own catalogs
pub fn is_system_table(name: &str) -> bool {
    name.split('.')
        .any(|part| part.starts_with("pg_") || part == "information_schema")
}
