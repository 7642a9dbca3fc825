//! Hint-SQL drafting.
//!
//! Template retrieval keys on SQL shape, not on the English question, so
//! the pipeline first drafts a plausible query: an LLM draft from the
//! raw question, with a deterministic rendering of the `Intent` as the
//! fallback when the model is unavailable or answers garbage.

use std::fmt::Write as _;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::domain::error::Result;
use crate::domain::intent::{Intent, QueryKind};
use crate::infrastructure::llm_clients::{ChatRequest, LlmClient};

/// Schema briefing shared by the drafter and the RAG generator.
pub const SCHEMA_CONTEXT: &str = "\
You are working with a healthcare cost database containing:

Tables and Columns:
- providers: provider_id, provider_name, provider_city, provider_state, provider_zip_code
- drg_procedures: drg_code, drg_description
- provider_procedures: provider_id, drg_code, total_discharges, average_covered_charges, average_total_payments, average_medicare_payments, provider_state
- provider_ratings: provider_id, overall_rating, quality_rating, safety_rating, patient_experience_rating

Key relationships:
- providers.provider_id -> provider_procedures.provider_id
- drg_procedures.drg_code -> provider_procedures.drg_code
- providers.provider_id -> provider_ratings.provider_id

IMPORTANT: use exact column names and optimized queries:
- State filtering: prefer pp.provider_state over joining providers when only the state is needed
- DRG description is 'drg_description', provider name is 'provider_name'
- Costs are 'average_covered_charges', 'average_total_payments', 'average_medicare_payments'";

static CODE_FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```(?:sql)?").unwrap());

pub struct SqlDrafter {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl SqlDrafter {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    /// One-shot LLM draft from the raw question.
    pub async fn draft_from_question(&self, question: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            system: None,
            user: format!(
                "{}\n\nUser Query: {}\n\nGenerate a PostgreSQL SELECT query. Return only the SQL, no explanations.\n\nSQL Query:",
                SCHEMA_CONTEXT, question
            ),
            temperature: 0.1,
            max_tokens: 500,
        };

        let raw = self.llm.chat(&request).await?;
        let sql = clean_generated_sql(&raw);
        debug!(sql, "Drafted hint SQL from question");
        Ok(sql)
    }

    /// Deterministic draft straight from the intent. Always succeeds;
    /// used when the LLM draft is unavailable.
    pub fn draft_from_intent(intent: &Intent) -> String {
        let mut sql = String::new();
        let mut conditions: Vec<String> = Vec::new();

        if let Some(procedure) = &intent.procedure_text {
            conditions.push(format!("d.drg_description ILIKE '%{}%'", procedure));
        } else if let Some(code) = &intent.drg_code {
            conditions.push(format!("d.drg_code = '{}'", code));
        }
        if let Some(state) = &intent.state {
            conditions.push(format!("pp.provider_state = '{}'", state));
        }

        match intent.query_kind {
            QueryKind::Cheapest | QueryKind::MostExpensive => {
                write!(
                    sql,
                    "SELECT d.drg_description, pp.average_covered_charges, pp.provider_id \
                     FROM drg_procedures d \
                     JOIN provider_procedures pp ON d.drg_code = pp.drg_code"
                )
                .unwrap();
                Self::push_where(&mut sql, &conditions);
                let direction = if intent.query_kind == QueryKind::MostExpensive {
                    "DESC"
                } else {
                    "ASC"
                };
                write!(sql, " ORDER BY pp.average_covered_charges {}", direction).unwrap();
            }
            QueryKind::CostComparison => {
                write!(
                    sql,
                    "SELECT d.drg_code, d.drg_description, AVG(pp.average_covered_charges) AS avg_cost \
                     FROM drg_procedures d \
                     JOIN provider_procedures pp ON d.drg_code = pp.drg_code"
                )
                .unwrap();
                Self::push_where(&mut sql, &conditions);
                write!(
                    sql,
                    " GROUP BY d.drg_code, d.drg_description ORDER BY avg_cost DESC"
                )
                .unwrap();
            }
            QueryKind::HighestRated => {
                let mut conditions = conditions;
                // ratings live off the providers table, so state filters
                // through the providers alias here
                if let Some(last) = conditions.last_mut() {
                    if last.starts_with("pp.provider_state") {
                        *last = last.replacen("pp.", "p.", 1);
                    }
                }
                if let Some(rating) = intent.min_rating {
                    conditions.push(format!("pr.overall_rating >= {}", rating));
                }
                if let Some(city) = &intent.city {
                    conditions.push(format!("p.provider_city ILIKE '%{}%'", city));
                }

                write!(
                    sql,
                    "SELECT p.provider_name, pr.overall_rating, p.provider_city, p.provider_state \
                     FROM providers p \
                     JOIN provider_ratings pr ON p.provider_id = pr.provider_id"
                )
                .unwrap();
                if intent.has_procedure_scope() {
                    write!(
                        sql,
                        " JOIN provider_procedures pp ON p.provider_id = pp.provider_id \
                         JOIN drg_procedures d ON pp.drg_code = d.drg_code"
                    )
                    .unwrap();
                }
                Self::push_where(&mut sql, &conditions);
                write!(sql, " ORDER BY pr.overall_rating DESC").unwrap();
            }
            QueryKind::VolumeLeaders => {
                write!(
                    sql,
                    "SELECT p.provider_name, pp.total_discharges, d.drg_description, \
                     p.provider_city, p.provider_state \
                     FROM providers p \
                     JOIN provider_procedures pp ON p.provider_id = pp.provider_id \
                     JOIN drg_procedures d ON pp.drg_code = d.drg_code"
                )
                .unwrap();
                Self::push_where(&mut sql, &conditions);
                write!(sql, " ORDER BY pp.total_discharges DESC").unwrap();
            }
            QueryKind::MultiProcedureStats => {
                let mut conditions = conditions;
                if let Some(last) = conditions.last_mut() {
                    if last.starts_with("pp.provider_state") {
                        *last = last.replacen("pp.", "p.", 1);
                    }
                }
                write!(
                    sql,
                    "SELECT p.provider_name, COUNT(DISTINCT pp.drg_code) AS procedure_count, \
                     AVG(pp.average_covered_charges) AS avg_cost, p.provider_city, p.provider_state \
                     FROM providers p \
                     JOIN provider_procedures pp ON p.provider_id = pp.provider_id"
                )
                .unwrap();
                Self::push_where(&mut sql, &conditions);
                write!(
                    sql,
                    " GROUP BY p.provider_id, p.provider_name, p.provider_city, p.provider_state \
                     ORDER BY procedure_count DESC"
                )
                .unwrap();
            }
        }

        write!(sql, " LIMIT {}", intent.limit).unwrap();
        sql
    }

    fn push_where(sql: &mut String, conditions: &[String]) {
        if !conditions.is_empty() {
            write!(sql, " WHERE {}", conditions.join(" AND ")).unwrap();
        }
    }
}

/// Strip markdown fences and anything after the first statement.
pub fn clean_generated_sql(raw: &str) -> String {
    let without_fences = CODE_FENCE_RE.replace_all(raw, "");
    let trimmed = without_fences.trim();
    match trimmed.split_once(';') {
        Some((first, _)) => first.trim().to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_generated_sql_strips_fences_and_extra_statements() {
        let raw = "```sql\nSELECT provider_name FROM providers LIMIT 5;\nDROP TABLE providers;\n```";
        assert_eq!(
            clean_generated_sql(raw),
            "SELECT provider_name FROM providers LIMIT 5"
        );
    }

    #[test]
    fn test_cheapest_draft_orders_ascending() {
        let intent = Intent {
            procedure_text: Some("hip replacement".to_string()),
            state: Some("NY".to_string()),
            limit: 5,
            ..Intent::default()
        };
        let sql = SqlDrafter::draft_from_intent(&intent);
        assert!(sql.contains("ILIKE '%hip replacement%'"));
        assert!(sql.contains("pp.provider_state = 'NY'"));
        assert!(sql.contains("ORDER BY pp.average_covered_charges ASC"));
        assert!(sql.ends_with("LIMIT 5"));
    }

    #[test]
    fn test_most_expensive_draft_orders_descending() {
        let intent = Intent {
            query_kind: QueryKind::MostExpensive,
            procedure_text: Some("knee replacement".to_string()),
            state: Some("TX".to_string()),
            limit: 10,
            ..Intent::default()
        };
        let sql = SqlDrafter::draft_from_intent(&intent);
        assert!(sql.contains("ORDER BY pp.average_covered_charges DESC"));
    }

    #[test]
    fn test_highest_rated_draft_joins_ratings() {
        let intent = Intent {
            query_kind: QueryKind::HighestRated,
            procedure_text: Some("heart surgery".to_string()),
            city: Some("Miami".to_string()),
            limit: 10,
            ..Intent::default()
        };
        let sql = SqlDrafter::draft_from_intent(&intent);
        assert!(sql.contains("provider_ratings"));
        assert!(sql.contains("p.provider_city ILIKE '%Miami%'"));
        assert!(sql.contains("ORDER BY pr.overall_rating DESC"));
    }

    #[test]
    fn test_state_alias_switches_for_rating_queries() {
        let intent = Intent {
            query_kind: QueryKind::HighestRated,
            state: Some("CA".to_string()),
            ..Intent::default()
        };
        let sql = SqlDrafter::draft_from_intent(&intent);
        assert!(sql.contains("p.provider_state = 'CA'"));
        assert!(!sql.contains("pp.provider_state"));
    }

    #[test]
    fn test_volume_and_aggregate_drafts_have_group_shapes() {
        let intent = Intent {
            query_kind: QueryKind::VolumeLeaders,
            drg_code: Some("470".to_string()),
            ..Intent::default()
        };
        let sql = SqlDrafter::draft_from_intent(&intent);
        assert!(sql.contains("total_discharges DESC"));

        let intent = Intent {
            query_kind: QueryKind::CostComparison,
            procedure_text: Some("hip replacement".to_string()),
            ..Intent::default()
        };
        let sql = SqlDrafter::draft_from_intent(&intent);
        assert!(sql.contains("GROUP BY d.drg_code"));
        assert!(sql.contains("AVG(pp.average_covered_charges)"));
    }
}
