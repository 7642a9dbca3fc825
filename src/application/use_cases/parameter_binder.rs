//! Template parameter binding.
//!
//! A matched template exposes placeholders `$1..$k`; the binder inspects
//! the syntactic context of each one (the tokens and operator just
//! before it) and draws the matching constant from the `Intent`. A
//! template asking for a field the intent does not carry is reported
//! `TemplateNotApplicable`, never guessed at.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::drg_resolver::ProcedureResolver;
use crate::domain::entities::Template;
use crate::domain::error::{AppError, Result};
use crate::domain::intent::Intent;

/// A fully bound, executable query plus its constants in template order.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    pub sql: String,
    pub constants: Vec<String>,
}

/// How a bound constant is emitted into the SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindKind {
    /// Quoted string literal.
    Text,
    /// Unquoted numeric literal.
    Number,
    /// ILIKE/LIKE argument, wrapped in `%...%` at emission.
    Pattern,
}

/// What a placeholder's context says it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindSite {
    DrgCode,
    DrgDescription,
    State,
    City,
    ZipCode,
    MinRating,
    MaxCost,
    Limit,
    Unrecognized,
}

/// Placeholders, bare or quoted, with their index.
static BIND_SITE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'\$(\d+)'|\$(\d+)").unwrap());

pub struct ParameterBinder {
    resolver: Arc<dyn ProcedureResolver>,
}

impl ParameterBinder {
    pub fn new(resolver: Arc<dyn ProcedureResolver>) -> Self {
        Self { resolver }
    }

    /// Bind `intent` into `template.raw_sql`. The emitted SQL contains no
    /// remaining `$n` tokens and exactly `placeholder_count` constants
    /// were used, or the template is not applicable.
    pub async fn bind(&self, template: &Template, intent: &Intent) -> Result<BoundQuery> {
        let raw_sql = &template.raw_sql;
        let mut bindings: BTreeMap<usize, (String, BindKind)> = BTreeMap::new();

        for captures in BIND_SITE_RE.captures_iter(raw_sql) {
            let index: usize = captures
                .get(1)
                .or_else(|| captures.get(2))
                .and_then(|m| m.as_str().parse().ok())
                .ok_or_else(|| AppError::Internal("Unparseable placeholder".to_string()))?;

            let site = classify_site(&context_tokens(
                raw_sql,
                captures.get(0).unwrap().start(),
            ));
            let (value, kind) = self.value_for(site, intent).await?;

            match bindings.get(&index) {
                Some((existing, _)) if existing != &value => {
                    return Err(AppError::TemplateNotApplicable(format!(
                        "Placeholder ${} appears in conflicting contexts",
                        index
                    )));
                }
                _ => {
                    bindings.insert(index, (value, kind));
                }
            }
        }

        let expected = template.placeholder_count();
        if bindings.len() != expected {
            return Err(AppError::TemplateNotApplicable(format!(
                "Bound {} constants but template expects {}",
                bindings.len(),
                expected
            )));
        }
        if bindings.keys().copied().ne(1..=expected) {
            return Err(AppError::TemplateNotApplicable(
                "Template placeholders are not contiguous".to_string(),
            ));
        }

        let sql = BIND_SITE_RE
            .replace_all(raw_sql, |captures: &regex::Captures<'_>| {
                let index: usize = captures
                    .get(1)
                    .or_else(|| captures.get(2))
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0);
                let (value, kind) = &bindings[&index];
                emit(value, *kind)
            })
            .into_owned();

        if BIND_SITE_RE.is_match(&sql) {
            return Err(AppError::Internal(
                "Placeholder survived parameter emission".to_string(),
            ));
        }

        let constants = bindings.into_values().map(|(value, _)| value).collect();
        debug!(template_id = template.template_id, ?constants, "Template bound");

        Ok(BoundQuery { sql, constants })
    }

    /// Resolve the intent field a bind site calls for. Values are kept
    /// bare here; wildcard wrapping happens at emission.
    async fn value_for(&self, site: BindSite, intent: &Intent) -> Result<(String, BindKind)> {
        match site {
            BindSite::DrgCode => {
                if let Some(code) = &intent.drg_code {
                    return Ok((code.clone(), BindKind::Text));
                }
                if let Some(phrase) = &intent.procedure_text {
                    if let Some(code) = self.resolver.resolve(phrase).await? {
                        return Ok((code, BindKind::Text));
                    }
                }
                Err(AppError::TemplateNotApplicable(
                    "Template needs a DRG code the intent cannot supply".to_string(),
                ))
            }
            BindSite::DrgDescription => {
                // Prefer the canonical catalog description so ILIKE hits
                // the medical wording, not the user's phrasing.
                let resolved_code = match &intent.drg_code {
                    Some(code) => Some(code.clone()),
                    None => match &intent.procedure_text {
                        Some(phrase) => self.resolver.resolve(phrase).await?,
                        None => None,
                    },
                };
                if let Some(code) = resolved_code {
                    if let Some(description) = self.resolver.description_for(&code).await? {
                        return Ok((description, BindKind::Pattern));
                    }
                }
                match &intent.procedure_text {
                    Some(phrase) => Ok((phrase.clone(), BindKind::Pattern)),
                    None => Err(AppError::TemplateNotApplicable(
                        "Template needs a procedure description".to_string(),
                    )),
                }
            }
            BindSite::State => intent
                .state
                .clone()
                .map(|state| (state, BindKind::Text))
                .ok_or_else(|| {
                    AppError::TemplateNotApplicable("Template needs a state".to_string())
                }),
            BindSite::City => intent
                .city
                .clone()
                .map(|city| (city, BindKind::Pattern))
                .ok_or_else(|| {
                    AppError::TemplateNotApplicable("Template needs a city".to_string())
                }),
            BindSite::ZipCode => intent
                .zip_code
                .clone()
                .map(|zip| (zip, BindKind::Pattern))
                .ok_or_else(|| {
                    AppError::TemplateNotApplicable("Template needs a ZIP code".to_string())
                }),
            BindSite::MinRating => intent
                .min_rating
                .map(|rating| (format_number(rating), BindKind::Number))
                .ok_or_else(|| {
                    AppError::TemplateNotApplicable("Template needs a minimum rating".to_string())
                }),
            BindSite::MaxCost => intent
                .max_cost
                .map(|cost| (format_number(cost), BindKind::Number))
                .ok_or_else(|| {
                    AppError::TemplateNotApplicable("Template needs a cost ceiling".to_string())
                }),
            BindSite::Limit => Ok((intent.limit.to_string(), BindKind::Number)),
            BindSite::Unrecognized => Err(AppError::TemplateNotApplicable(
                "Unrecognized placeholder context".to_string(),
            )),
        }
    }
}

/// The up-to-three tokens preceding a placeholder, lowercased.
fn context_tokens(sql: &str, position: usize) -> Vec<String> {
    sql[..position]
        .split_whitespace()
        .rev()
        .take(3)
        .map(|token| token.to_lowercase())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

/// Classify a placeholder by the column and operator just before it.
fn classify_site(tokens: &[String]) -> BindSite {
    let Some(operator) = tokens.last() else {
        return BindSite::Unrecognized;
    };

    if operator == "limit" {
        return BindSite::Limit;
    }

    let Some(column) = tokens.len().checked_sub(2).map(|i| tokens[i].as_str()) else {
        return BindSite::Unrecognized;
    };

    match operator.as_str() {
        "=" if column.contains("drg_code") => BindSite::DrgCode,
        "=" if column.contains("provider_state") => BindSite::State,
        "ilike" | "like" if column.contains("drg_description") => BindSite::DrgDescription,
        "ilike" if column.contains("provider_city") => BindSite::City,
        "like" | "ilike" if column.contains("provider_zip_code") => BindSite::ZipCode,
        ">=" if column.contains("overall_rating") => BindSite::MinRating,
        "<=" if column.contains("average_covered_charges") => BindSite::MaxCost,
        _ => BindSite::Unrecognized,
    }
}

/// Escape a value for inclusion in a single-quoted literal.
fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn emit(value: &str, kind: BindKind) -> String {
    match kind {
        BindKind::Text => format!("'{}'", escape(value)),
        BindKind::Number => value.to_string(),
        BindKind::Pattern => format!("'%{}%'", escape(value.trim_matches('%'))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubResolver;

    #[async_trait]
    impl ProcedureResolver for StubResolver {
        async fn resolve(&self, phrase: &str) -> Result<Option<String>> {
            match phrase {
                "hip replacement" => Ok(Some("470".to_string())),
                "heart surgery" => Ok(Some("233".to_string())),
                _ => Ok(None),
            }
        }

        async fn description_for(&self, drg_code: &str) -> Result<Option<String>> {
            match drg_code {
                "470" => Ok(Some(
                    "MAJOR JOINT REPLACEMENT OF LOWER EXTREMITY".to_string(),
                )),
                "233" => Ok(Some("CORONARY BYPASS".to_string())),
                _ => Ok(None),
            }
        }
    }

    fn binder() -> ParameterBinder {
        ParameterBinder::new(Arc::new(StubResolver))
    }

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

    const DRG_STATE_TEMPLATE: &str = "SELECT p.provider_name, pp.average_covered_charges \
        FROM providers p \
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id \
        JOIN drg_procedures d ON pp.drg_code = d.drg_code \
        WHERE d.drg_code = $1 AND p.provider_state = $2 \
        ORDER BY pp.average_covered_charges ASC LIMIT $3";

    #[tokio::test]
    async fn test_binds_drg_state_limit_in_order() {
        let intent = Intent {
            drg_code: Some("470".to_string()),
            state: Some("NY".to_string()),
            limit: 5,
            ..Intent::default()
        };

        let bound = binder()
            .bind(&template(DRG_STATE_TEMPLATE), &intent)
            .await
            .unwrap();

        assert_eq!(bound.constants, vec!["470", "NY", "5"]);
        assert!(bound.sql.contains("d.drg_code = '470'"));
        assert!(bound.sql.contains("p.provider_state = 'NY'"));
        assert!(bound.sql.contains("LIMIT 5"));
        assert!(!bound.sql.contains('$'));
    }

    #[tokio::test]
    async fn test_resolves_drg_code_from_procedure_text() {
        let intent = Intent {
            procedure_text: Some("hip replacement".to_string()),
            state: Some("TX".to_string()),
            limit: 10,
            ..Intent::default()
        };

        let bound = binder()
            .bind(&template(DRG_STATE_TEMPLATE), &intent)
            .await
            .unwrap();

        assert!(bound.sql.contains("d.drg_code = '470'"));
    }

    #[tokio::test]
    async fn test_ilike_wraps_at_emission_only() {
        let raw = "SELECT p.provider_name FROM providers p \
                   JOIN provider_procedures pp ON p.provider_id = pp.provider_id \
                   JOIN drg_procedures d ON pp.drg_code = d.drg_code \
                   WHERE d.drg_description ILIKE $1 LIMIT $2";
        let intent = Intent {
            procedure_text: Some("hip replacement".to_string()),
            ..Intent::default()
        };

        let bound = binder().bind(&template(raw), &intent).await.unwrap();

        // constant stays bare, wildcards appear only in the SQL text
        assert_eq!(
            bound.constants[0],
            "MAJOR JOINT REPLACEMENT OF LOWER EXTREMITY"
        );
        assert!(bound
            .sql
            .contains("ILIKE '%MAJOR JOINT REPLACEMENT OF LOWER EXTREMITY%'"));
    }

    #[tokio::test]
    async fn test_unresolvable_procedure_falls_back_to_phrase() {
        let raw = "SELECT p.provider_name FROM providers p \
                   JOIN drg_procedures d ON 1 = 1 \
                   WHERE d.drg_description ILIKE $1 LIMIT $2";
        let intent = Intent {
            procedure_text: Some("toenail trim".to_string()),
            ..Intent::default()
        };

        let bound = binder().bind(&template(raw), &intent).await.unwrap();
        assert!(bound.sql.contains("ILIKE '%toenail trim%'"));
    }

    #[tokio::test]
    async fn test_missing_state_is_not_applicable() {
        let intent = Intent {
            drg_code: Some("470".to_string()),
            ..Intent::default()
        };

        let err = binder()
            .bind(&template(DRG_STATE_TEMPLATE), &intent)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TemplateNotApplicable(_)));
    }

    #[tokio::test]
    async fn test_two_state_comparison_is_not_applicable() {
        let raw = "SELECT p.provider_state, AVG(pp.average_covered_charges) \
                   FROM providers p \
                   JOIN provider_procedures pp ON p.provider_id = pp.provider_id \
                   WHERE p.provider_state IN ($1, $2) \
                   GROUP BY p.provider_state";
        let intent = Intent {
            state: Some("NY".to_string()),
            ..Intent::default()
        };

        let err = binder().bind(&template(raw), &intent).await.unwrap_err();
        assert!(matches!(err, AppError::TemplateNotApplicable(_)));
    }

    #[tokio::test]
    async fn test_rating_threshold_emits_unquoted_number() {
        let raw = "SELECT p.provider_name, pr.overall_rating \
                   FROM providers p \
                   JOIN provider_ratings pr ON p.provider_id = pr.provider_id \
                   WHERE pr.overall_rating >= $1 AND p.provider_state = $2 \
                   ORDER BY pr.overall_rating DESC LIMIT $3";
        let intent = Intent {
            min_rating: Some(8.5),
            state: Some("CA".to_string()),
            limit: 10,
            ..Intent::default()
        };

        let bound = binder().bind(&template(raw), &intent).await.unwrap();
        assert!(bound.sql.contains("overall_rating >= 8.5"));
        assert!(!bound.sql.contains("'8.5'"));
    }

    #[tokio::test]
    async fn test_city_value_is_escaped() {
        let raw = "SELECT p.provider_name FROM providers p \
                   WHERE p.provider_city ILIKE $1 LIMIT $2";
        let intent = Intent {
            city: Some("O'Fallon".to_string()),
            ..Intent::default()
        };

        let bound = binder().bind(&template(raw), &intent).await.unwrap();
        assert!(bound.sql.contains("'%O''Fallon%'"));
    }

    #[tokio::test]
    async fn test_quoted_placeholder_form_is_bound() {
        let raw = "SELECT p.provider_name FROM providers p \
                   WHERE p.provider_state = '$1' LIMIT $2";
        let intent = Intent {
            state: Some("FL".to_string()),
            limit: 3,
            ..Intent::default()
        };

        let bound = binder().bind(&template(raw), &intent).await.unwrap();
        assert!(bound.sql.contains("provider_state = 'FL'"));
        assert_eq!(bound.constants, vec!["FL", "3"]);
    }
}
