//! Natural-language summary of executed results.

use std::sync::Arc;

use tracing::warn;

use crate::domain::entities::ResultRow;
use crate::infrastructure::llm_clients::{ChatRequest, LlmClient};

/// Small, inexpensive model for summaries.
const EXPLAIN_MODEL: &str = "gpt-4o-mini";

/// Returned whenever summarization fails; the query itself succeeded.
pub const DEFAULT_EXPLANATION: &str = "Query executed successfully.";

/// Rows sampled into the prompt.
const SAMPLE_ROWS: usize = 3;

pub struct Explainer {
    llm: Arc<dyn LlmClient>,
}

impl Explainer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Summarize the results for the user. Never fails.
    pub async fn explain(&self, question: &str, sql: &str, rows: &[ResultRow]) -> String {
        let request = ChatRequest {
            model: EXPLAIN_MODEL.to_string(),
            system: None,
            user: build_prompt(question, sql, rows),
            temperature: 0.3,
            max_tokens: 300,
        };

        match self.llm.chat(&request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => DEFAULT_EXPLANATION.to_string(),
            Err(err) => {
                warn!(error = %err, "Result explanation failed");
                DEFAULT_EXPLANATION.to_string()
            }
        }
    }
}

fn build_prompt(question: &str, sql: &str, rows: &[ResultRow]) -> String {
    let mut summary = format!("Found {} results", rows.len());
    if !rows.is_empty() {
        let sample: Vec<&ResultRow> = rows.iter().take(SAMPLE_ROWS).collect();
        summary.push_str(&format!(
            ". Sample data: {}",
            serde_json::to_string(&sample).unwrap_or_default()
        ));
    }

    format!(
        "User asked: {}\nSQL executed: {}\nResults: {}\n\n\
         Provide a brief, natural language explanation of what these results show.\n\
         Focus on answering the user's original question.\n\
         Be concise and helpful.",
        question, sql, summary
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_samples_at_most_three_rows() {
        let rows: Vec<ResultRow> = (0..10)
            .map(|i| {
                let mut row = ResultRow::new();
                row.insert(
                    "provider_name".to_string(),
                    serde_json::Value::String(format!("Hospital {}", i)),
                );
                row
            })
            .collect();

        let prompt = build_prompt("cheapest?", "SELECT 1", &rows);
        assert!(prompt.contains("Found 10 results"));
        assert!(prompt.contains("Hospital 2"));
        assert!(!prompt.contains("Hospital 3"));
    }

    #[test]
    fn test_prompt_for_empty_rows() {
        let prompt = build_prompt("anything?", "SELECT 1", &[]);
        assert!(prompt.contains("Found 0 results"));
        assert!(!prompt.contains("Sample data"));
    }
}
