//! Layered safety policy for every SQL candidate before execution.
//!
//! Applied to both binder output and RAG output. Deny by default: a query
//! is accepted only with zero unsafe issues and a score of at least 0.7.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use super::sql_normalizer::SqlNormalizer;

/// Keywords that must never appear as whole words.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "truncate", "alter", "create", "grant", "revoke",
    "copy", "execute", "call", "merge", "replace", "upsert", "pg_", "dblink",
];

/// Functions allowed in generated queries (whitelist approach).
const ALLOWED_FUNCTIONS: &[&str] = &[
    // aggregation
    "count", "sum", "avg", "min", "max", "stddev", "variance",
    // string
    "upper", "lower", "trim", "ltrim", "rtrim", "substring", "length", "concat", "coalesce",
    "nullif", "ilike", "like", "similarity",
    // date
    "now", "current_date", "current_timestamp", "extract", "date_part", "age", "date_trunc",
    // math
    "abs", "ceil", "floor", "round", "power", "sqrt",
    // type conversion
    "cast", "to_char", "to_date", "to_number",
];

/// Tables the engine may read.
const ALLOWED_TABLES: &[&str] = &[
    "providers",
    "drg_procedures",
    "provider_procedures",
    "provider_ratings",
    "template_catalog",
    "csv_column_mappings",
];

static INJECTION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"'\s*or\s+'", "quoted OR injection"),
        (r"'\s*and\s+'", "quoted AND injection"),
        (r"--", "inline comment"),
        (r"/\*.*\*/", "block comment"),
        (r";\s*drop", "chained DROP"),
        (r"union\s+select", "UNION injection"),
        (r"exec\s*\(", "EXEC call"),
    ]
    .iter()
    .map(|(pattern, label)| (Regex::new(pattern).unwrap(), *label))
    .collect()
});

static COMMENT_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"--[^\n]*").unwrap());
static COMMENT_BLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Unsafe,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
}

impl ValidationIssue {
    fn unsafe_issue(category: &str, message: String, fragment: Option<String>) -> Self {
        Self {
            severity: IssueSeverity::Unsafe,
            category: category.to_string(),
            message,
            fragment,
        }
    }

    fn warning(category: &str, message: String) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            category: category.to_string(),
            message,
            fragment: None,
        }
    }
}

/// Complete validation report for one candidate SQL.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyReport {
    pub is_safe: bool,
    pub score: f64,
    pub issues: Vec<ValidationIssue>,
    pub referenced_tables: Vec<String>,
    pub complexity: u32,
}

impl SafetyReport {
    fn unsafe_report(issues: Vec<ValidationIssue>) -> Self {
        Self {
            is_safe: false,
            score: 0.0,
            issues,
            referenced_tables: Vec::new(),
            complexity: 100,
        }
    }

    pub fn unsafe_reasons(&self) -> String {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Unsafe)
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Limits for the soft complexity rules.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub max_joins: u32,
    pub max_subqueries: u32,
    pub max_where_conditions: u32,
    pub max_rows: i64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_joins: 5,
            max_subqueries: 3,
            max_where_conditions: 10,
            max_rows: 1000,
        }
    }
}

pub struct SafetyValidator {
    normalizer: SqlNormalizer,
    limits: SafetyLimits,
    allowed_functions: HashSet<&'static str>,
    allowed_tables: HashSet<&'static str>,
}

impl SafetyValidator {
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            normalizer: SqlNormalizer::new(),
            limits,
            allowed_functions: ALLOWED_FUNCTIONS.iter().copied().collect(),
            allowed_tables: ALLOWED_TABLES.iter().copied().collect(),
        }
    }

    /// Validate one candidate. The report carries every issue found, the
    /// referenced tables and the structural complexity.
    pub fn validate(&self, sql: &str) -> SafetyReport {
        let mut issues = Vec::new();

        // Injection patterns run against the raw input, before comment
        // stripping can hide them.
        let raw_lower = sql.to_lowercase();
        for (pattern, label) in INJECTION_PATTERNS.iter() {
            if let Some(found) = pattern.find(&raw_lower) {
                issues.push(ValidationIssue::unsafe_issue(
                    "injection",
                    format!("Potential SQL injection pattern detected: {}", label),
                    Some(found.as_str().to_string()),
                ));
            }
        }

        let cleaned = Self::clean_sql(sql);
        if cleaned.is_empty() {
            issues.push(ValidationIssue::unsafe_issue(
                "syntax",
                "Empty SQL query".to_string(),
                None,
            ));
            return SafetyReport::unsafe_report(issues);
        }
        if cleaned.contains(';') {
            issues.push(ValidationIssue::unsafe_issue(
                "syntax",
                "Multiple SQL statements detected".to_string(),
                None,
            ));
        }
        if cleaned.len() > 5000 {
            issues.push(ValidationIssue::warning(
                "syntax",
                "SQL query is very long and may be complex".to_string(),
            ));
        }

        // Forbidden keywords as whole words, checked on the cleaned text
        // so keyword-bearing comments cannot mask them either way.
        let cleaned_lower = cleaned.to_lowercase();
        for keyword in FORBIDDEN_KEYWORDS {
            if Self::contains_keyword(&cleaned_lower, keyword) {
                issues.push(ValidationIssue::unsafe_issue(
                    "forbidden_keyword",
                    format!("Forbidden keyword detected: {}", keyword),
                    Some((*keyword).to_string()),
                ));
            }
        }

        if self.normalizer.safety_precheck(&cleaned).is_err() {
            issues.push(ValidationIssue::unsafe_issue(
                "statement_type",
                "Only a single SELECT statement is allowed".to_string(),
                None,
            ));
            warn!(issues = issues.len(), "SQL rejected before structural analysis");
            return SafetyReport::unsafe_report(issues);
        }

        let structure = match self.normalizer.analyze(&cleaned) {
            Some(structure) => structure,
            None => {
                issues.push(ValidationIssue::unsafe_issue(
                    "parsing",
                    "Failed to parse SQL query".to_string(),
                    None,
                ));
                return SafetyReport::unsafe_report(issues);
            }
        };

        // Table allowlist
        for table in &structure.tables {
            if !self.allowed_tables.contains(table.as_str()) {
                issues.push(ValidationIssue::unsafe_issue(
                    "table_access",
                    format!("Access to non-whitelisted table: {}", table),
                    Some(table.clone()),
                ));
            }
        }

        // Function whitelist
        for function in &structure.function_names {
            if !self.allowed_functions.contains(function.as_str()) {
                issues.push(ValidationIssue::warning(
                    "function",
                    format!("Non-whitelisted function used: {}", function),
                ));
            }
        }

        // Complexity bounds
        if structure.joins > self.limits.max_joins {
            issues.push(ValidationIssue::warning(
                "complexity",
                format!(
                    "Too many JOINs: {} (max: {})",
                    structure.joins, self.limits.max_joins
                ),
            ));
        }
        if structure.subqueries > self.limits.max_subqueries {
            issues.push(ValidationIssue::warning(
                "complexity",
                format!(
                    "Too many subqueries: {} (max: {})",
                    structure.subqueries, self.limits.max_subqueries
                ),
            ));
        }
        if structure.where_clauses > self.limits.max_where_conditions {
            issues.push(ValidationIssue::warning(
                "complexity",
                format!(
                    "Too many WHERE clauses: {} (max: {})",
                    structure.where_clauses, self.limits.max_where_conditions
                ),
            ));
        }

        // LIMIT clause
        match self.normalizer.limit_value(&cleaned) {
            Some(limit) if limit > self.limits.max_rows => {
                issues.push(ValidationIssue::warning(
                    "complexity",
                    format!("LIMIT too high: {} (max: {})", limit, self.limits.max_rows),
                ));
            }
            Some(_) => {}
            None => {
                issues.push(ValidationIssue::warning(
                    "complexity",
                    "No LIMIT clause specified".to_string(),
                ));
            }
        }

        // SELECT * exposure
        if self.normalizer.selects_wildcard(&cleaned) {
            issues.push(ValidationIssue::warning(
                "data_exposure",
                "SELECT * may expose unintended columns".to_string(),
            ));
        }

        let complexity = structure.complexity();
        let score = Self::score(&issues, complexity);
        let is_safe = score >= 0.7
            && !issues
                .iter()
                .any(|issue| issue.severity == IssueSeverity::Unsafe);

        debug!(is_safe, score, complexity, issues = issues.len(), "SQL validated");

        SafetyReport {
            is_safe,
            score,
            issues,
            referenced_tables: structure.tables,
            complexity,
        }
    }

    fn clean_sql(sql: &str) -> String {
        let without_line = COMMENT_LINE_RE.replace_all(sql, "");
        let without_block = COMMENT_BLOCK_RE.replace_all(&without_line, "");
        let collapsed = without_block.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim_end_matches(';').trim().to_string()
    }

    /// Whole-word keyword test. The `pg_` entry matches any identifier
    /// with that prefix.
    fn contains_keyword(sql_lower: &str, keyword: &str) -> bool {
        let pattern = if let Some(prefix) = keyword.strip_suffix('_') {
            format!(r"\b{}_", regex::escape(prefix))
        } else {
            format!(r"\b{}\b", regex::escape(keyword))
        };
        Regex::new(&pattern)
            .map(|re| re.is_match(sql_lower))
            .unwrap_or(false)
    }

    /// Start at 1.0, subtract 0.5 per unsafe issue and 0.1 per warning,
    /// then 0.2 above complexity 20 or 0.1 above 10. Floor at zero.
    fn score(issues: &[ValidationIssue], complexity: u32) -> f64 {
        let mut score: f64 = 1.0;
        for issue in issues {
            score -= match issue.severity {
                IssueSeverity::Unsafe => 0.5,
                IssueSeverity::Warning => 0.1,
            };
        }
        if complexity > 20 {
            score -= 0.2;
        } else if complexity > 10 {
            score -= 0.1;
        }
        score.max(0.0)
    }
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new(SafetyLimits::default())
    }
}
