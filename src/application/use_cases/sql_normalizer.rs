//! SQL canonicalization for template matching.
//!
//! Converts a statement into a retrieval key by pretty-printing the AST
//! and replacing literals with numbered placeholders. When the parser
//! cannot handle the input, a regex pass takes over and the result is
//! flagged `parse_degraded`.

use core::ops::ControlFlow;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

use crate::domain::error::{AppError, Result};

/// Output of one normalization pass.
///
/// `canonical_sql` is the lowercased, whitespace-collapsed retrieval key.
/// `parameterized_sql` keeps the pretty-printed casing and is suitable as
/// a template `raw_sql` (contiguous `$n`, no literals).
#[derive(Debug, Clone)]
pub struct NormalizedSql {
    pub canonical_sql: String,
    pub parameterized_sql: String,
    pub constants: Vec<String>,
    pub parse_degraded: bool,
}

/// Matches, in one left-to-right scan: quoted placeholders, string
/// literals, bare placeholders, numeric literals. Branch order matters:
/// placeholder forms must win over the generic literal branches.
static LITERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'\$\d+'|'[^']*'|\$\d+|\b\d+(?:\.\d+)?\b").unwrap());

static PLACEHOLDER_INDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").unwrap());

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static OPERATOR_SPACING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*([=<>!]+)\s*").unwrap());

pub struct SqlNormalizer;

impl SqlNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Canonicalize `sql`, extracting literal constants in placeholder
    /// order. Pre-existing `$n` placeholders pass through untouched; new
    /// ones are numbered after the highest existing index so the result
    /// is a fixed point under re-normalization.
    pub fn normalize(&self, sql: &str) -> NormalizedSql {
        let trimmed = sql.trim().trim_end_matches(';').trim();

        let (pretty, parse_degraded) = match Self::parse_single(trimmed) {
            Ok(statement) => (statement.to_string(), false),
            Err(err) => {
                warn!(error = %err, "SQL parse failed, using regex normalization");
                (WHITESPACE_RE.replace_all(trimmed, " ").into_owned(), true)
            }
        };

        let (parameterized_sql, constants) = Self::replace_literals(&pretty);
        let canonical_sql = Self::canonical_form(&parameterized_sql);

        debug!(
            constants = constants.len(),
            parse_degraded, "Normalized SQL: {}", canonical_sql
        );

        NormalizedSql {
            canonical_sql,
            parameterized_sql,
            constants,
            parse_degraded,
        }
    }

    /// Reject anything that is not exactly one SELECT statement.
    pub fn safety_precheck(&self, sql: &str) -> Result<()> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Err(AppError::UnsafeSql("Empty SQL statement".to_string()));
        }
        if trimmed.contains(';') {
            return Err(AppError::UnsafeSql(
                "Multiple SQL statements detected".to_string(),
            ));
        }

        let statement = Self::parse_single(trimmed)
            .map_err(|e| AppError::UnsafeSql(format!("SQL does not parse: {}", e)))?;

        match &statement {
            Statement::Query(query) => match query.body.as_ref() {
                SetExpr::Select(_) => Ok(()),
                other => Err(AppError::UnsafeSql(format!(
                    "Only plain SELECT statements are allowed, found {}",
                    set_expr_kind(other)
                ))),
            },
            _ => Err(AppError::UnsafeSql(
                "Only SELECT statements are allowed".to_string(),
            )),
        }
    }

    /// One structural pass over the AST. `None` when the SQL does not
    /// parse as a single statement.
    pub fn analyze(&self, sql: &str) -> Option<SqlStructure> {
        let statement = Self::parse_single(sql.trim().trim_end_matches(';')).ok()?;

        let mut visitor = AnalysisVisitor::default();
        let _ = statement.visit(&mut visitor);

        visitor.tables.sort();
        visitor.tables.dedup();
        visitor.function_names.sort();
        visitor.function_names.dedup();

        Some(SqlStructure {
            tables: visitor.tables,
            joins: visitor.joins,
            subqueries: visitor.subqueries,
            where_clauses: visitor.where_clauses,
            functions: visitor.functions,
            function_names: visitor.function_names,
            order_by_clauses: visitor.order_by_clauses,
        })
    }

    /// Tables referenced anywhere in the statement, lowercased, deduped.
    pub fn referenced_tables(&self, sql: &str) -> Vec<String> {
        self.analyze(sql).map(|s| s.tables).unwrap_or_default()
    }

    /// Structural complexity: 1 + 2·joins + 3·subqueries + WHERE clauses
    /// + functions + ORDER BY clauses. Unparseable input scores 100.
    pub fn complexity_score(&self, sql: &str) -> u32 {
        match self.analyze(sql) {
            Some(structure) => structure.complexity(),
            None => 100,
        }
    }

    /// The top-level LIMIT value, when present as a plain number.
    pub fn limit_value(&self, sql: &str) -> Option<i64> {
        let statement = Self::parse_single(sql.trim().trim_end_matches(';')).ok()?;
        let Statement::Query(query) = statement else {
            return None;
        };
        match query.limit {
            Some(Expr::Value(sqlparser::ast::Value::Number(n, _))) => n.parse().ok(),
            _ => None,
        }
    }

    /// Whether the top-level statement selects `*`.
    pub fn selects_wildcard(&self, sql: &str) -> bool {
        let Ok(Statement::Query(query)) = Self::parse_single(sql.trim().trim_end_matches(';'))
        else {
            return false;
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            return false;
        };
        select.projection.iter().any(|item| {
            matches!(
                item,
                sqlparser::ast::SelectItem::Wildcard(_)
                    | sqlparser::ast::SelectItem::QualifiedWildcard(_, _)
            )
        })
    }

    fn parse_single(sql: &str) -> std::result::Result<Statement, String> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| e.to_string())?;
        match statements.len() {
            1 => Ok(statements.into_iter().next().unwrap()),
            0 => Err("empty statement".to_string()),
            n => Err(format!("{} statements, expected 1", n)),
        }
    }

    /// Replace literals with `$k` placeholders in token order, preserving
    /// any placeholders already present.
    fn replace_literals(sql: &str) -> (String, Vec<String>) {
        let mut counter = Self::highest_placeholder(sql) + 1;
        let mut constants = Vec::new();

        let replaced = LITERAL_RE.replace_all(sql, |caps: &regex::Captures<'_>| {
            let token = caps.get(0).unwrap().as_str();
            if token.starts_with("'$") || token.starts_with('$') {
                // pre-existing placeholder, quoted or bare
                return token.to_string();
            }
            if let Some(inner) = token
                .strip_prefix('\'')
                .and_then(|rest| rest.strip_suffix('\''))
            {
                constants.push(inner.to_string());
                let placeholder = format!("'${}'", counter);
                counter += 1;
                return placeholder;
            }
            constants.push(token.to_string());
            let placeholder = format!("${}", counter);
            counter += 1;
            placeholder
        });

        (replaced.into_owned(), constants)
    }

    fn highest_placeholder(sql: &str) -> usize {
        PLACEHOLDER_INDEX_RE
            .captures_iter(sql)
            .filter_map(|c| c[1].parse::<usize>().ok())
            .max()
            .unwrap_or(0)
    }

    fn canonical_form(sql: &str) -> String {
        let lowered = sql.to_lowercase();
        let collapsed = WHITESPACE_RE.replace_all(&lowered, " ");
        let spaced = OPERATOR_SPACING_RE.replace_all(&collapsed, " $1 ");
        spaced.trim().trim_end_matches(';').trim().to_string()
    }
}

impl Default for SqlNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural counts for one statement.
#[derive(Debug, Clone)]
pub struct SqlStructure {
    pub tables: Vec<String>,
    pub joins: u32,
    pub subqueries: u32,
    pub where_clauses: u32,
    pub functions: u32,
    pub function_names: Vec<String>,
    pub order_by_clauses: u32,
}

impl SqlStructure {
    pub fn complexity(&self) -> u32 {
        1 + self.joins * 2
            + self.subqueries * 3
            + self.where_clauses
            + self.functions
            + self.order_by_clauses
    }
}

fn set_expr_kind(expr: &SetExpr) -> &'static str {
    match expr {
        SetExpr::Select(_) => "SELECT",
        SetExpr::Query(_) => "nested query",
        SetExpr::SetOperation { .. } => "set operation",
        SetExpr::Values(_) => "VALUES",
        SetExpr::Insert(_) => "INSERT",
        SetExpr::Update(_) => "UPDATE",
        SetExpr::Table(_) => "TABLE",
    }
}

/// Collects structural counts in one pass over the AST.
#[derive(Default)]
struct AnalysisVisitor {
    tables: Vec<String>,
    joins: u32,
    subqueries: u32,
    where_clauses: u32,
    functions: u32,
    function_names: Vec<String>,
    order_by_clauses: u32,
}

impl AnalysisVisitor {
    /// Query-level counts. Recurses through WITH bodies and set-operation
    /// arms; expression-level subqueries are reached by the visitor
    /// callbacks instead.
    fn tally_query(&mut self, query: &Query) {
        if query.order_by.is_some() {
            self.order_by_clauses += 1;
        }
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.tally_query(&cte.query);
            }
        }
        self.tally_set_expr(&query.body);
    }

    fn tally_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                self.joins += select
                    .from
                    .iter()
                    .map(|table| table.joins.len() as u32)
                    .sum::<u32>();
                if select.selection.is_some() {
                    self.where_clauses += 1;
                }
            }
            SetExpr::Query(query) => self.tally_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.tally_set_expr(left);
                self.tally_set_expr(right);
            }
            _ => {}
        }
    }
}

impl Visitor for AnalysisVisitor {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        if let Statement::Query(query) = statement {
            self.tally_query(query);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(ident) = relation.0.last() {
            self.tables.push(ident.value.to_lowercase());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Derived { subquery, .. } = table_factor {
            self.subqueries += 1;
            self.tally_query(subquery);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Function(function) => {
                self.functions += 1;
                if let Some(ident) = function.name.0.last() {
                    self.function_names.push(ident.value.to_lowercase());
                }
            }
            Expr::Subquery(subquery) => {
                self.subqueries += 1;
                self.tally_query(subquery);
            }
            Expr::InSubquery { subquery, .. } => {
                self.subqueries += 1;
                self.tally_query(subquery);
            }
            Expr::Exists { subquery, .. } => {
                self.subqueries += 1;
                self.tally_query(subquery);
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_replacement_in_token_order() {
        let normalizer = SqlNormalizer::new();
        let result = normalizer.normalize(
            "SELECT provider_name FROM providers WHERE provider_state = 'NY' LIMIT 5",
        );
        assert!(!result.parse_degraded);
        assert_eq!(result.constants, vec!["NY".to_string(), "5".to_string()]);
        assert!(result.canonical_sql.contains("provider_state = '$1'"));
        assert!(result.canonical_sql.contains("limit $2"));
        assert!(result.canonical_sql.chars().all(|c| !c.is_uppercase()));
    }

    #[test]
    fn test_preexisting_placeholders_preserved() {
        let normalizer = SqlNormalizer::new();
        let sql = "SELECT provider_name FROM providers WHERE drg_code = $1 LIMIT $2";
        let result = normalizer.normalize(sql);
        assert!(result.constants.is_empty());
        assert!(result.canonical_sql.contains("drg_code = $1"));
        assert!(result.canonical_sql.contains("limit $2"));
    }

    #[test]
    fn test_mixed_placeholders_number_after_existing() {
        let normalizer = SqlNormalizer::new();
        let sql = "SELECT provider_name FROM providers WHERE drg_code = $1 AND provider_state = 'TX'";
        let result = normalizer.normalize(sql);
        assert_eq!(result.constants, vec!["TX".to_string()]);
        assert!(result.canonical_sql.contains("drg_code = $1"));
        assert!(result.canonical_sql.contains("provider_state = '$2'"));
    }

    #[test]
    fn test_normalization_is_fixed_point() {
        let normalizer = SqlNormalizer::new();
        let sql = "SELECT p.provider_name, pp.average_covered_charges FROM providers p \
                   JOIN provider_procedures pp ON p.provider_id = pp.provider_id \
                   WHERE d.drg_description ILIKE '%hip%' AND p.provider_state = 'NY' \
                   ORDER BY pp.average_covered_charges ASC LIMIT 10";
        let first = normalizer.normalize(sql);
        let second = normalizer.normalize(&first.canonical_sql);
        assert_eq!(first.canonical_sql, second.canonical_sql);
        assert!(second.constants.is_empty());
    }

    #[test]
    fn test_degraded_fallback_still_parameterizes() {
        let normalizer = SqlNormalizer::new();
        let result = normalizer.normalize("SELEKT provider_name WHER provider_state = 'NY'");
        assert!(result.parse_degraded);
        assert_eq!(result.constants, vec!["NY".to_string()]);
        assert!(result.canonical_sql.contains("'$1'"));
    }

    #[test]
    fn test_referenced_tables() {
        let normalizer = SqlNormalizer::new();
        let tables = normalizer.referenced_tables(
            "SELECT p.provider_name FROM providers p \
             JOIN provider_procedures pp ON p.provider_id = pp.provider_id \
             JOIN drg_procedures d ON pp.drg_code = d.drg_code",
        );
        assert_eq!(
            tables,
            vec![
                "drg_procedures".to_string(),
                "provider_procedures".to_string(),
                "providers".to_string()
            ]
        );
    }

    #[test]
    fn test_complexity_grows_with_structure() {
        let normalizer = SqlNormalizer::new();
        let simple = normalizer.complexity_score("SELECT provider_name FROM providers");
        let joined = normalizer.complexity_score(
            "SELECT p.provider_name, AVG(pp.average_covered_charges) FROM providers p \
             JOIN provider_procedures pp ON p.provider_id = pp.provider_id \
             WHERE p.provider_state = 'NY' GROUP BY p.provider_name \
             ORDER BY 2 DESC",
        );
        assert!(joined > simple);
        assert_eq!(normalizer.complexity_score("not sql at all"), 100);
    }

    #[test]
    fn test_safety_precheck() {
        let normalizer = SqlNormalizer::new();
        assert!(normalizer
            .safety_precheck("SELECT provider_name FROM providers")
            .is_ok());
        assert!(normalizer
            .safety_precheck("SELECT provider_name FROM providers; DROP TABLE providers")
            .is_err());
        assert!(normalizer
            .safety_precheck("INSERT INTO providers VALUES ('x')")
            .is_err());
        assert!(normalizer.safety_precheck("   ").is_err());
    }

    #[test]
    fn test_limit_value() {
        let normalizer = SqlNormalizer::new();
        assert_eq!(
            normalizer.limit_value("SELECT provider_name FROM providers LIMIT 25"),
            Some(25)
        );
        assert_eq!(
            normalizer.limit_value("SELECT provider_name FROM providers"),
            None
        );
    }

    #[test]
    fn test_selects_wildcard() {
        let normalizer = SqlNormalizer::new();
        assert!(normalizer.selects_wildcard("SELECT * FROM providers"));
        assert!(!normalizer.selects_wildcard("SELECT provider_name FROM providers"));
    }
}
