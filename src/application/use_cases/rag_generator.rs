//! RAG fallback SQL generation.
//!
//! When no template clears the confidence gate, retrieved exemplars are
//! folded into a prompt and the model writes a novel query. Each attempt
//! gets a fresh prompt carrying what went wrong before.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::debug;

use super::sql_drafter::{clean_generated_sql, SCHEMA_CONTEXT};
use crate::domain::entities::TemplateMatch;
use crate::domain::error::{AppError, Result};
use crate::domain::intent::Intent;
use crate::infrastructure::llm_clients::{ChatRequest, LlmClient};

pub struct RagGenerator {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl RagGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    /// Generate one candidate SQL. `previous_failure` feeds the prior
    /// attempt's rejection back into the prompt.
    pub async fn generate(
        &self,
        question: &str,
        intent: &Intent,
        exemplars: &[TemplateMatch],
        attempt: u32,
        previous_failure: Option<&str>,
    ) -> Result<String> {
        let prompt = build_prompt(question, intent, exemplars, attempt, previous_failure);

        let request = ChatRequest {
            model: self.model.clone(),
            system: None,
            user: prompt,
            temperature: 0.1,
            max_tokens: 800,
        };

        let raw = self.llm.chat(&request).await?;
        let sql = clean_generated_sql(&raw);
        if sql.is_empty() {
            return Err(AppError::RetrievalMiss(
                "Model produced no SQL".to_string(),
            ));
        }

        debug!(attempt, sql, "RAG candidate generated");
        Ok(sql)
    }
}

/// Assemble the exemplar prompt.
pub fn build_prompt(
    question: &str,
    intent: &Intent,
    exemplars: &[TemplateMatch],
    attempt: u32,
    previous_failure: Option<&str>,
) -> String {
    let mut prompt = String::new();

    writeln!(prompt, "{}", SCHEMA_CONTEXT).unwrap();
    writeln!(prompt).unwrap();

    if !exemplars.is_empty() {
        writeln!(prompt, "Similar query examples:").unwrap();
        for (idx, exemplar) in exemplars.iter().enumerate() {
            writeln!(prompt).unwrap();
            writeln!(prompt, "Example {}:", idx + 1).unwrap();
            writeln!(prompt, "SQL: {}", exemplar.template.raw_sql.trim()).unwrap();
            writeln!(prompt, "Description: {}", exemplar.template.comment).unwrap();
        }
        writeln!(prompt).unwrap();
    }

    writeln!(prompt, "User Query: {}", question).unwrap();
    writeln!(
        prompt,
        "Structured Parameters: {}",
        serde_json::to_string(intent).unwrap_or_default()
    )
    .unwrap();

    if let Some(failure) = previous_failure {
        writeln!(prompt).unwrap();
        writeln!(
            prompt,
            "The previous attempt (attempt {}) was rejected: {}. Produce a corrected query.",
            attempt.saturating_sub(1),
            failure
        )
        .unwrap();
    }

    writeln!(prompt).unwrap();
    writeln!(
        prompt,
        "Generate a PostgreSQL SELECT query that answers the user's question."
    )
    .unwrap();
    writeln!(prompt, "Requirements:").unwrap();
    writeln!(prompt, "- Use only SELECT statements").unwrap();
    writeln!(prompt, "- Use proper JOIN syntax when needed").unwrap();
    writeln!(prompt, "- Include appropriate WHERE clauses").unwrap();
    writeln!(prompt, "- Add ORDER BY and LIMIT as needed").unwrap();
    writeln!(prompt, "- Use exact table and column names from the schema").unwrap();
    writeln!(prompt, "- Return only the SQL query, no explanations").unwrap();
    writeln!(prompt).unwrap();
    write!(prompt, "SQL Query:").unwrap();

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Template;

    fn exemplar(raw_sql: &str, comment: &str) -> TemplateMatch {
        TemplateMatch {
            template: Template {
                template_id: 1,
                canonical_sql: raw_sql.to_lowercase(),
                raw_sql: raw_sql.to_string(),
                comment: comment.to_string(),
                created_at: None,
                updated_at: None,
            },
            similarity: 0.8,
            edit_distance: 0,
            confidence: 0.8,
        }
    }

    #[test]
    fn test_prompt_contains_exemplars_and_question() {
        let prompt = build_prompt(
            "cheapest hip replacement in NY",
            &Intent::default(),
            &[exemplar(
                "SELECT provider_name FROM providers WHERE provider_state = $1 LIMIT $2",
                "Cheapest providers in a state",
            )],
            1,
            None,
        );
        assert!(prompt.contains("Example 1:"));
        assert!(prompt.contains("Cheapest providers in a state"));
        assert!(prompt.contains("cheapest hip replacement in NY"));
        assert!(prompt.contains("Return only the SQL query"));
    }

    #[test]
    fn test_retry_prompt_carries_failure() {
        let prompt = build_prompt(
            "cheapest hip replacement",
            &Intent::default(),
            &[],
            2,
            Some("referenced a non-whitelisted table"),
        );
        assert!(prompt.contains("was rejected: referenced a non-whitelisted table"));
    }

    #[test]
    fn test_prompt_without_exemplars_skips_section() {
        let prompt = build_prompt("anything", &Intent::default(), &[], 1, None);
        assert!(!prompt.contains("Similar query examples"));
    }
}
