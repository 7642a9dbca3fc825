//! Persistent and value records shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// A parameterized SQL template from the catalog.
///
/// `raw_sql` carries `$1..$k` placeholders as written by the author;
/// `canonical_sql` is the normalized retrieval key. The embedding is
/// generated from `canonical_sql` (plus the comment) and matches the
/// embedder's declared dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: i64,
    pub canonical_sql: String,
    pub raw_sql: String,
    pub comment: String,
    #[serde(skip)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub updated_at: Option<DateTime<Utc>>,
}

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").unwrap());

impl Template {
    /// Number of distinct placeholders, taken as the highest `$n` index.
    pub fn placeholder_count(&self) -> usize {
        PLACEHOLDER_RE
            .captures_iter(&self.raw_sql)
            .filter_map(|c| c[1].parse::<usize>().ok())
            .max()
            .unwrap_or(0)
    }
}

/// A retrieval candidate with its blended confidence.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateMatch {
    pub template: Template,
    /// Cosine similarity against the query embedding, in [0, 1].
    pub similarity: f64,
    /// Levenshtein distance between the query SQL and the candidate's
    /// canonical SQL. Zero until the rerank step fills it in.
    pub edit_distance: usize,
    /// 0.7 * similarity + 0.3 * (1 - edit_distance / max_len), in [0, 1].
    pub confidence: f64,
}

/// A scored DRG candidate from the resolver's debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct DrgMatch {
    pub drg_code: String,
    pub drg_description: String,
    pub score: f64,
}

/// One result row, keyed by column name.
pub type ResultRow = HashMap<String, serde_json::Value>;

/// The engine's public answer. On failure, `answer` comes from the fixed
/// safe-message catalog and `sql` is always absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub success: bool,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<ResultRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(raw_sql: &str) -> Template {
        Template {
            template_id: 1,
            canonical_sql: raw_sql.to_lowercase(),
            raw_sql: raw_sql.to_string(),
            comment: String::new(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_placeholder_count() {
        let t = template("SELECT a FROM providers WHERE x = $1 AND y = $2 LIMIT $3");
        assert_eq!(t.placeholder_count(), 3);

        let t = template("SELECT a FROM providers");
        assert_eq!(t.placeholder_count(), 0);

        // repeated placeholder does not inflate the count
        let t = template("SELECT a FROM providers WHERE x = $1 OR z = $1 LIMIT $2");
        assert_eq!(t.placeholder_count(), 2);
    }

    #[test]
    fn test_failure_response_serializes_without_sql() {
        let response = AskResponse {
            success: false,
            answer: "No matching data found for your question.".to_string(),
            sql: None,
            rows: None,
            template_id: None,
            confidence: None,
            elapsed_ms: 12,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("\"sql\""));
    }
}
