//! Natural-language question to typed `Intent`.
//!
//! One forced tool call against a fixed JSON schema. Any failure
//! (transport, refused call, malformed arguments) degrades to the
//! default intent rather than failing the request; retrieval can still
//! succeed on the raw question.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::domain::intent::{normalize_state, Intent, QueryKind};
use crate::infrastructure::llm_clients::{ChatRequest, LlmClient, ToolSpec};

const EXTRACTION_TOOL: &str = "extract_healthcare_query_parameters";

const SYSTEM_PROMPT: &str = "You are a healthcare query parameter extractor. \
Extract structured information from natural language healthcare queries.";

pub struct IntentExtractor {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_rows: i64,
}

impl IntentExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, model: String, max_rows: i64) -> Self {
        Self {
            llm,
            model,
            max_rows,
        }
    }

    /// Extract an `Intent` from the question. Never fails; a degraded
    /// default comes back when extraction does not produce valid fields.
    pub async fn extract(&self, question: &str) -> Intent {
        let request = ChatRequest {
            model: self.model.clone(),
            system: Some(SYSTEM_PROMPT.to_string()),
            user: format!("Extract parameters from this healthcare query: {}", question),
            temperature: 0.1,
            max_tokens: 400,
        };

        let tool = ToolSpec {
            name: EXTRACTION_TOOL.to_string(),
            description: "Extract structured parameters from a healthcare cost/quality query"
                .to_string(),
            parameters: extraction_schema(),
        };

        match self.llm.chat_with_tool(&request, &tool).await {
            Ok(arguments) => match intent_from_tool_args(&arguments, self.max_rows) {
                Some(intent) => {
                    debug!(?intent, "Intent extracted");
                    intent
                }
                None => {
                    warn!(question, "Tool call returned unusable arguments, using default intent");
                    Intent::degraded_default()
                }
            },
            Err(err) => {
                warn!(question, error = %err, "Intent extraction failed, using default intent");
                Intent::degraded_default()
            }
        }
    }
}

/// The fixed extraction schema. `query_kind` is the only required field.
fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query_kind": {
                "type": "string",
                "enum": [
                    "cheapest",
                    "most_expensive",
                    "highest_rated",
                    "cost_comparison",
                    "volume_leaders",
                    "multi_procedure_stats"
                ],
                "description": "The type of healthcare query being made"
            },
            "procedure_text": {
                "type": "string",
                "description": "Medical procedure or treatment (e.g. 'hip replacement', 'heart surgery')"
            },
            "drg_code": {
                "type": "string",
                "description": "DRG code if specifically mentioned (e.g. '470')"
            },
            "state": {
                "type": "string",
                "description": "US state name or code (e.g. 'NY', 'New York', 'California')"
            },
            "city": {
                "type": "string",
                "description": "City name (e.g. 'Los Angeles', 'Miami')"
            },
            "zip_code": {
                "type": "string",
                "description": "ZIP code if mentioned"
            },
            "min_rating": {
                "type": "number",
                "description": "Minimum quality rating if specified (1.0 to 10.0)"
            },
            "max_cost": {
                "type": "number",
                "description": "Maximum cost limit if specified"
            },
            "limit": {
                "type": "integer",
                "description": "Number of results requested (default: 10)"
            }
        },
        "required": ["query_kind"]
    })
}

/// Turn tool-call arguments into an `Intent`. `None` when `query_kind`
/// is missing or unknown.
pub fn intent_from_tool_args(arguments: &Value, max_rows: i64) -> Option<Intent> {
    let query_kind = QueryKind::parse(arguments.get("query_kind")?.as_str()?)?;

    let text_field = |name: &str| -> Option<String> {
        arguments
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let limit = arguments
        .get("limit")
        .and_then(Value::as_i64)
        .unwrap_or(10)
        .clamp(1, max_rows);

    Some(Intent {
        query_kind,
        procedure_text: text_field("procedure_text"),
        drg_code: text_field("drg_code"),
        state: text_field("state").map(|s| normalize_state(&s)),
        city: text_field("city"),
        zip_code: text_field("zip_code"),
        min_rating: arguments.get("min_rating").and_then(Value::as_f64),
        max_cost: arguments.get("max_cost").and_then(Value::as_f64),
        limit,
        degraded: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_extraction() {
        let arguments = json!({
            "query_kind": "highest_rated",
            "procedure_text": "heart surgery",
            "city": "Miami",
            "limit": 5
        });
        let intent = intent_from_tool_args(&arguments, 1000).unwrap();
        assert_eq!(intent.query_kind, QueryKind::HighestRated);
        assert_eq!(intent.procedure_text.as_deref(), Some("heart surgery"));
        assert_eq!(intent.city.as_deref(), Some("Miami"));
        assert_eq!(intent.limit, 5);
        assert!(!intent.degraded);
    }

    #[test]
    fn test_state_names_are_normalized() {
        let arguments = json!({ "query_kind": "cheapest", "state": "New York" });
        let intent = intent_from_tool_args(&arguments, 1000).unwrap();
        assert_eq!(intent.state.as_deref(), Some("NY"));
    }

    #[test]
    fn test_limit_defaults_and_clamps() {
        let arguments = json!({ "query_kind": "cheapest" });
        assert_eq!(intent_from_tool_args(&arguments, 1000).unwrap().limit, 10);

        let arguments = json!({ "query_kind": "cheapest", "limit": 999999 });
        assert_eq!(intent_from_tool_args(&arguments, 1000).unwrap().limit, 1000);

        let arguments = json!({ "query_kind": "cheapest", "limit": 0 });
        assert_eq!(intent_from_tool_args(&arguments, 1000).unwrap().limit, 1);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let arguments = json!({ "query_kind": "make_me_a_sandwich" });
        assert!(intent_from_tool_args(&arguments, 1000).is_none());
    }

    #[test]
    fn test_empty_strings_dropped() {
        let arguments = json!({ "query_kind": "cheapest", "city": "  ", "drg_code": "" });
        let intent = intent_from_tool_args(&arguments, 1000).unwrap();
        assert!(intent.city.is_none());
        assert!(intent.drg_code.is_none());
    }
}
