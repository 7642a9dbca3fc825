//! The NL→SQL pipeline orchestrator.
//!
//! Drives one question through intent extraction, template retrieval,
//! parameter binding, validation and execution, with a RAG fallback
//! loop when no template applies. Per-stage sub-budgets keep the whole
//! request inside `REQUEST_TIMEOUT_MS`, and a cancellation token aborts
//! the request at whichever suspension point it is parked on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::drg_resolver::ProcedureResolver;
use super::explainer::Explainer;
use super::intent_extractor::IntentExtractor;
use super::parameter_binder::{BoundQuery, ParameterBinder};
use super::query_executor::QueryExecutor;
use super::rag_generator::RagGenerator;
use super::safety_validator::{SafetyLimits, SafetyValidator};
use super::sql_drafter::SqlDrafter;
use super::sql_normalizer::SqlNormalizer;
use crate::domain::entities::{AskResponse, ResultRow, TemplateMatch};
use crate::domain::error::{AppError, Result};
use crate::domain::intent::Intent;
use crate::infrastructure::bootstrap::EngineContext;

/// Sub-budget for one embedding call.
const EMBED_TIMEOUT: Duration = Duration::from_secs(5);
/// Sub-budget for one template search.
const SEARCH_TIMEOUT: Duration = Duration::from_millis(500);
/// Sub-budget for one LLM call.
const LLM_TIMEOUT: Duration = Duration::from_secs(10);
/// Sub-budget for one database query.
const DB_TIMEOUT: Duration = Duration::from_secs(5);
/// RAG fallback attempts per request.
const MAX_ATTEMPTS: u32 = 3;
/// Exemplars retrieved for the fallback prompt.
const EXEMPLAR_COUNT: i64 = 3;

/// What a successful stage run hands to the explainer.
struct Execution {
    sql: String,
    rows: Vec<ResultRow>,
    template_id: Option<i64>,
    confidence: Option<f64>,
}

pub struct QueryPipeline {
    ctx: Arc<EngineContext>,
    extractor: IntentExtractor,
    drafter: SqlDrafter,
    rag: RagGenerator,
    explainer: Explainer,
    binder: ParameterBinder,
    validator: SafetyValidator,
    normalizer: SqlNormalizer,
    executor: QueryExecutor,
    cancel: CancellationToken,
}

impl QueryPipeline {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self::with_cancellation(ctx, CancellationToken::new())
    }

    pub fn with_cancellation(ctx: Arc<EngineContext>, cancel: CancellationToken) -> Self {
        let settings = &ctx.settings;
        let limits = SafetyLimits {
            max_joins: settings.max_joins,
            max_subqueries: settings.max_subqueries,
            max_where_conditions: 10,
            max_rows: settings.max_rows,
        };

        Self {
            extractor: IntentExtractor::new(
                Arc::clone(&ctx.llm),
                settings.chat_model.clone(),
                settings.max_rows,
            ),
            drafter: SqlDrafter::new(Arc::clone(&ctx.llm), settings.chat_model.clone()),
            rag: RagGenerator::new(Arc::clone(&ctx.llm), settings.chat_model.clone()),
            explainer: Explainer::new(Arc::clone(&ctx.llm)),
            binder: ParameterBinder::new(
                Arc::clone(&ctx.drg_resolver) as Arc<dyn ProcedureResolver>
            ),
            validator: SafetyValidator::new(limits),
            normalizer: SqlNormalizer::new(),
            executor: QueryExecutor::new(ctx.pool.clone()),
            cancel,
            ctx,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Answer one question. Always returns a response; on failure the
    /// answer is a user-safe string and no SQL is attached.
    pub async fn ask(&self, question: &str) -> AskResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let budget = Duration::from_millis(self.ctx.settings.request_timeout_ms);

        info!(%request_id, question, "Processing question");

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(AppError::Internal("Request cancelled".to_string())),
            result = timeout(budget, self.run(question, started, budget)) => match result {
                Ok(inner) => inner,
                Err(_) => Err(AppError::Busy("Request deadline exceeded".to_string())),
            },
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok((execution, answer)) => {
                info!(%request_id, elapsed_ms, rows = execution.rows.len(), "Question answered");
                AskResponse {
                    success: true,
                    answer,
                    sql: Some(execution.sql),
                    rows: Some(execution.rows),
                    template_id: execution.template_id,
                    confidence: execution.confidence,
                    elapsed_ms,
                }
            }
            Err(err) => {
                warn!(%request_id, elapsed_ms, error = %err, "Question failed");
                AskResponse {
                    success: false,
                    answer: err.user_safe_message().to_string(),
                    sql: None,
                    rows: None,
                    template_id: None,
                    confidence: None,
                    elapsed_ms,
                }
            }
        }
    }

    async fn run(
        &self,
        question: &str,
        started: Instant,
        budget: Duration,
    ) -> Result<(Execution, String)> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::InputInvalid("Empty question".to_string()));
        }

        // Parsing: intent extraction and hint drafting are independent
        // upstream calls; run them together and join before retrieval.
        let (intent_result, draft_result) = tokio::join!(
            timeout(LLM_TIMEOUT, self.extractor.extract(question)),
            timeout(LLM_TIMEOUT, self.drafter.draft_from_question(question)),
        );

        let intent = intent_result.unwrap_or_else(|_| {
            warn!("Intent extraction timed out, using default intent");
            Intent::degraded_default()
        });

        let hint_sql = match draft_result {
            Ok(Ok(sql)) if !sql.trim().is_empty() => sql,
            Ok(Err(err)) => {
                self.check_busy(&err, started, budget)?;
                debug!(error = %err, "Hint draft failed, rendering intent deterministically");
                SqlDrafter::draft_from_intent(&intent)
            }
            _ => SqlDrafter::draft_from_intent(&intent),
        };

        // Templating
        match self.try_template_path(question, &intent, &hint_sql).await {
            Ok(Some(execution)) => {
                let answer = self.explain(question, &execution).await;
                return Ok((execution, answer));
            }
            Ok(None) => debug!("No applicable template, falling back to RAG"),
            Err(err) => {
                self.check_busy(&err, started, budget)?;
                debug!(error = %err, "Template path failed, falling back to RAG");
            }
        }

        // Fallback
        let execution = self
            .rag_fallback(question, &intent, started, budget)
            .await?;
        let answer = self.explain(question, &execution).await;
        Ok((execution, answer))
    }

    /// Templating → Binding → Executing. `Ok(None)` means "no confident
    /// match or not applicable" and sends the orchestrator to fallback.
    async fn try_template_path(
        &self,
        question: &str,
        intent: &Intent,
        hint_sql: &str,
    ) -> Result<Option<Execution>> {
        let normalized = self.normalizer.normalize(hint_sql);

        let query_vec = timeout(
            EMBED_TIMEOUT,
            self.ctx.embedder.embed(&normalized.canonical_sql),
        )
        .await
        .map_err(|_| AppError::UpstreamUnavailable("Embedding timed out".to_string()))??;

        let matched = timeout(
            SEARCH_TIMEOUT,
            self.ctx.template_store.best_match(
                &query_vec,
                &normalized.canonical_sql,
                self.ctx.settings.confidence_threshold,
                Some(intent.bindable_field_count()),
            ),
        )
        .await
        .map_err(|_| AppError::UpstreamUnavailable("Template search timed out".to_string()))??;

        let Some(matched) = matched else {
            return Ok(None);
        };

        let bound = match self.binder.bind(&matched.template, intent).await {
            Ok(bound) => bound,
            Err(AppError::TemplateNotApplicable(reason)) => {
                debug!(
                    template_id = matched.template.template_id,
                    reason, "Matched template not applicable to intent"
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        match self.execute_candidate(&bound, &matched).await {
            Ok(rows) => Ok(Some(Execution {
                sql: bound.sql,
                rows,
                template_id: Some(matched.template.template_id),
                confidence: Some(matched.confidence),
            })),
            Err(err) => {
                warn!(
                    question,
                    template_id = matched.template.template_id,
                    error = %err,
                    "Template execution rejected, falling back"
                );
                Ok(None)
            }
        }
    }

    /// Validate and execute one bound template candidate.
    async fn execute_candidate(
        &self,
        bound: &BoundQuery,
        matched: &TemplateMatch,
    ) -> Result<Vec<ResultRow>> {
        let report = self.validator.validate(&bound.sql);
        if !report.is_safe {
            return Err(AppError::UnsafeSql(format!(
                "Template {} candidate rejected: {}",
                matched.template.template_id,
                report.unsafe_reasons()
            )));
        }
        if report.complexity > self.ctx.settings.max_complexity {
            warn!(
                complexity = report.complexity,
                max = self.ctx.settings.max_complexity,
                "Executing a high-complexity query"
            );
        }

        self.executor
            .execute(&bound.sql, self.ctx.settings.max_rows, DB_TIMEOUT)
            .await
    }

    /// RAG generation loop: up to `MAX_ATTEMPTS` candidates, each
    /// revalidated, each failure folded into the next prompt.
    async fn rag_fallback(
        &self,
        question: &str,
        intent: &Intent,
        started: Instant,
        budget: Duration,
    ) -> Result<Execution> {
        let exemplars = self.fetch_exemplars(question).await;
        let mut last_failure: Option<String> = None;
        let mut last_error = AppError::RetrievalMiss(format!(
            "No valid SQL after {} attempts",
            MAX_ATTEMPTS
        ));

        for attempt in 1..=MAX_ATTEMPTS {
            let generated = timeout(
                LLM_TIMEOUT,
                self.rag
                    .generate(question, intent, &exemplars, attempt, last_failure.as_deref()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(AppError::UpstreamUnavailable(
                    "SQL generation timed out".to_string(),
                ))
            });

            let sql = match generated {
                Ok(sql) => sql,
                Err(err) => {
                    self.check_busy(&err, started, budget)?;
                    warn!(attempt, error = %err, "SQL generation attempt failed");
                    last_failure = Some("the model produced no usable SQL".to_string());
                    last_error = err;
                    continue;
                }
            };

            let report = self.validator.validate(&sql);
            if !report.is_safe {
                // Unsafe verdicts are fatal for the candidate, never for
                // the request.
                let reasons = report.unsafe_reasons();
                warn!(attempt, reasons, "Generated SQL failed safety validation");
                last_failure = Some(if reasons.is_empty() {
                    "the query failed safety validation".to_string()
                } else {
                    reasons.clone()
                });
                last_error = AppError::UnsafeSql(reasons);
                continue;
            }

            match self
                .executor
                .execute(&sql, self.ctx.settings.max_rows, DB_TIMEOUT)
                .await
            {
                Ok(rows) => {
                    self.spawn_learning(question, &sql);
                    return Ok(Execution {
                        sql,
                        rows,
                        template_id: None,
                        confidence: None,
                    });
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Generated SQL execution failed");
                    last_failure = Some(format!("execution was rejected with: {}", err));
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    /// Exemplars for the fallback prompt; best-effort, empty on failure.
    async fn fetch_exemplars(&self, question: &str) -> Vec<TemplateMatch> {
        let question_vec = match timeout(EMBED_TIMEOUT, self.ctx.embedder.embed(question)).await {
            Ok(Ok(vec)) => vec,
            _ => {
                debug!("Question embedding unavailable, generating without exemplars");
                return Vec::new();
            }
        };

        match timeout(
            SEARCH_TIMEOUT,
            self.ctx
                .template_store
                .suggestions(&question_vec, EXEMPLAR_COUNT),
        )
        .await
        {
            Ok(Ok(exemplars)) => exemplars,
            _ => Vec::new(),
        }
    }

    /// Catalog learning for a successful novel query. Fire-and-forget:
    /// failures are logged, never surfaced; a cancelled request aborts
    /// the insert before its transaction commits.
    fn spawn_learning(&self, question: &str, sql: &str) {
        if !self.ctx.settings.enable_template_learning {
            return;
        }

        let normalized = self.normalizer.normalize(sql);
        if normalized.parse_degraded {
            debug!("Skipping learning for unparseable SQL");
            return;
        }

        let store = Arc::clone(&self.ctx.template_store);
        let comment = format!(
            "Auto-generated from question: {}",
            truncate(question, 100)
        );
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Learning aborted by cancellation");
                }
                result = store.learn(
                    &normalized.canonical_sql,
                    &normalized.parameterized_sql,
                    &comment,
                ) => {
                    if let Err(err) = result {
                        warn!(error = %err, "Template learning failed");
                    }
                }
            }
        });
    }

    async fn explain(&self, question: &str, execution: &Execution) -> String {
        timeout(
            LLM_TIMEOUT,
            self.explainer
                .explain(question, &execution.sql, &execution.rows),
        )
        .await
        .unwrap_or_else(|_| super::explainer::DEFAULT_EXPLANATION.to_string())
    }

    /// Backpressure: once half the request budget is gone, a rate-limited
    /// upstream turns into a typed `Busy` instead of queueing further.
    fn check_busy(&self, err: &AppError, started: Instant, budget: Duration) -> Result<()> {
        if matches!(err, AppError::Busy(_)) && started.elapsed() >= budget / 2 {
            return Err(err.clone());
        }
        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("cheapest hip replacement", 8), "cheapest");
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 100), "short");
    }
}
