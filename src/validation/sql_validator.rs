use crate::api::middleware::AppError;
use sqlparser::ast::{
    visit_relations, visit_relations_mut, Ident, ObjectName, ObjectNamePart, Query, SetExpr, Statement, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::ops::ControlFlow;

/// SQL validation and rewriting helpers, all AST based
pub struct SqlValidator;

impl SqlValidator {
    /// Validate SQL query and ensure it's a SELECT statement
    pub fn validate_select_only(sql: &str) -> Result<String, AppError> {
        for stmt in &parse(sql)? {
            let kind = match stmt {
                Statement::Query(query) => {
                    // CTE bodies and subqueries may still write
                    if let ControlFlow::Break(kind) = query.visit(&mut ReadOnlyCheck) {
                        return Err(AppError::InvalidSql(format!(
                            "{} is not allowed. Only SELECT queries are permitted.",
                            kind
                        )));
                    }
                    continue;
                }
                Statement::Insert { .. } => "INSERT",
                Statement::Update { .. } => "UPDATE",
                Statement::Delete { .. } => "DELETE",
                Statement::Drop { .. } => "DROP",
                Statement::CreateTable { .. } => "CREATE TABLE",
                other => {
                    return Err(AppError::InvalidSql(format!(
                        "Only SELECT queries are permitted. Found: {}",
                        other
                    )))
                }
            };
            return Err(AppError::InvalidSql(format!(
                "{} statements are not allowed. Only SELECT queries are permitted.",
                kind
            )));
        }

        Ok(sql.to_string())
    }

    /// Tables referenced by the statement, in order of first appearance.
    ///
    /// Qualified names contribute only their last part.
    pub fn extract_table_names(sql: &str) -> Result<Vec<String>, AppError> {
        let statements = parse(sql)?;
        let ctes = cte_names(&statements);

        let mut seen = HashSet::new();
        let mut tables = Vec::new();
        for stmt in &statements {
            let _ = visit_relations(stmt, |name: &ObjectName| {
                if let Some(table) = name.0.last().map(|part| part_value(part)) {
                    let is_cte = name.0.len() == 1 && ctes.contains(&table.to_lowercase());
                    if !is_cte && seen.insert(table.to_lowercase()) {
                        tables.push(table);
                    }
                }
                ControlFlow::<()>::Continue(())
            });
        }
        Ok(tables)
    }

    /// Prefix bare references to `known_tables` with `qualifier`.
    ///
    /// Matching is case-insensitive. Names that are already qualified, CTE
    /// names, column references and string literals are left untouched. The
    /// qualifier may itself be dotted (`catalog.schema`).
    pub fn qualify_table_names(sql: &str, known_tables: &[String], qualifier: &str) -> Result<String, AppError> {
        let qualifier: Vec<Ident> = qualifier
            .split('.')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Ident::new)
            .collect();
        if qualifier.is_empty() || known_tables.is_empty() {
            return Ok(sql.to_string());
        }

        let known: HashSet<String> = known_tables.iter().map(|t| t.to_lowercase()).collect();
        let mut statements = parse(sql)?;
        let ctes = cte_names(&statements);

        for stmt in statements.iter_mut() {
            let _ = visit_relations_mut(stmt, |name: &mut ObjectName| {
                let table = match name.0.as_slice() {
                    [ObjectNamePart::Identifier(ident)] => ident.clone(),
                    _ => return ControlFlow::<()>::Continue(()),
                };
                let key = table.value.to_lowercase();
                if known.contains(&key) && !ctes.contains(&key) {
                    let mut parts = qualifier.clone();
                    parts.push(table);
                    *name = ObjectName::from(parts);
                }
                ControlFlow::Continue(())
            });
        }

        Ok(statements
            .iter()
            .map(|stmt| stmt.to_string())
            .collect::<Vec<_>>()
            .join("; "))
    }
}

fn parse(sql: &str) -> Result<Vec<Statement>, AppError> {
    let dialect = PostgreSqlDialect {};
    let statements = Parser::parse_sql(&dialect, sql)
        .map_err(|e| AppError::InvalidSql(format!("SQL parsing error: {}", e)))?;

    if statements.is_empty() {
        return Err(AppError::InvalidSql("Empty SQL query".to_string()));
    }
    Ok(statements)
}

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        other => other.to_string(),
    }
}

/// Collects the lowercased names of every CTE defined anywhere in a statement
#[derive(Default)]
struct CteCollector {
    names: HashSet<String>,
}

impl Visitor for CteCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Stops at the first query body that is not a plain read
struct ReadOnlyCheck;

impl Visitor for ReadOnlyCheck {
    type Break = String;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        match write_in(&query.body) {
            Some(kind) => ControlFlow::Break(kind),
            None => ControlFlow::Continue(()),
        }
    }
}

fn write_in(body: &SetExpr) -> Option<String> {
    match body {
        SetExpr::Select(select) if select.into.is_some() => Some("SELECT INTO".to_string()),
        SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::Values(_) | SetExpr::Table(_) => None,
        SetExpr::SetOperation { left, right, .. } => write_in(left).or_else(|| write_in(right)),
        other => Some(format!(
            "Data-modifying query ({})",
            other.to_string().split_whitespace().next().unwrap_or_default()
        )),
    }
}

fn cte_names(statements: &[Statement]) -> HashSet<String> {
    let mut collector = CteCollector::default();
    for stmt in statements {
        let _ = stmt.visit(&mut collector);
    }
    collector.names
}
