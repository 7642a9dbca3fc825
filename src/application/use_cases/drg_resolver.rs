//! Free-text procedure phrase to DRG code resolution.
//!
//! Primary path is vector search over the embedded DRG descriptions;
//! when the embedder is down the resolver degrades to trigram similarity
//! so "knee replacement" still finds DRG 470.

use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::PgPool;
use tracing::{info, warn};

use super::embedding_service::EmbeddingService;
use crate::domain::entities::DrgMatch;
use crate::domain::error::{AppError, Result};

/// Trigram similarity floor for the fallback search.
const TRIGRAM_FLOOR: f64 = 0.3;

/// The binder's seam onto DRG resolution, so it can be exercised without
/// a database.
#[async_trait]
pub trait ProcedureResolver: Send + Sync {
    /// Map a free-text phrase to the best DRG code, if any.
    async fn resolve(&self, phrase: &str) -> Result<Option<String>>;

    /// The canonical description for a DRG code.
    async fn description_for(&self, drg_code: &str) -> Result<Option<String>>;
}

pub struct DrgResolver {
    pool: PgPool,
    embedder: Arc<EmbeddingService>,
    similarity_floor: f64,
}

impl DrgResolver {
    pub fn new(pool: PgPool, embedder: Arc<EmbeddingService>, similarity_floor: f64) -> Self {
        Self {
            pool,
            embedder,
            similarity_floor,
        }
    }

    /// Scored DRG candidates for a phrase, best first. Debug/UX surface.
    pub async fn similar(&self, phrase: &str, k: i64) -> Result<Vec<DrgMatch>> {
        let phrase = phrase.trim();
        if phrase.is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(phrase).await?;

        let rows = sqlx::query_as::<_, (String, String, f64)>(
            r#"
            SELECT
                drg_code,
                drg_description,
                (1 - (embedding <=> $1::vector))::float8 AS similarity
            FROM drg_procedures
            WHERE embedding IS NOT NULL
              AND (1 - (embedding <=> $1::vector))::float8 >= $2
            ORDER BY embedding <=> $1::vector
            LIMIT $3
            "#,
        )
        .bind(Vector::from(embedding))
        .bind(self.similarity_floor)
        .bind(k)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::ExecutionError(format!("DRG search failed: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(drg_code, drg_description, score)| DrgMatch {
                drg_code,
                drg_description,
                score,
            })
            .collect())
    }

    /// Trigram fallback over descriptions when embeddings are unavailable.
    async fn trigram_lookup(&self, phrase: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String, f64)>(
            r#"
            SELECT drg_code, similarity(drg_description, $1)::float8 AS sim_score
            FROM drg_procedures
            WHERE drg_description ILIKE '%' || $1 || '%'
            ORDER BY similarity(drg_description, $1) DESC
            LIMIT 1
            "#,
        )
        .bind(phrase)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::ExecutionError(format!("DRG trigram lookup failed: {}", e)))?;

        match row {
            Some((drg_code, score)) if score >= TRIGRAM_FLOOR => {
                info!(phrase, drg_code, score, "DRG trigram fallback matched");
                Ok(Some(drg_code))
            }
            _ => {
                warn!(phrase, "DRG trigram fallback found no match");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ProcedureResolver for DrgResolver {
    async fn resolve(&self, phrase: &str) -> Result<Option<String>> {
        let phrase = phrase.trim();
        if phrase.is_empty() {
            return Ok(None);
        }

        match self.similar(phrase, 1).await {
            Ok(matches) => match matches.into_iter().next() {
                Some(m) => {
                    info!(
                        phrase,
                        drg_code = %m.drg_code,
                        description = %m.drg_description,
                        score = m.score,
                        "DRG semantic lookup matched"
                    );
                    Ok(Some(m.drg_code))
                }
                None => {
                    warn!(phrase, floor = self.similarity_floor, "No DRG above similarity floor");
                    Ok(None)
                }
            },
            Err(err) if err.is_transient() => {
                warn!(phrase, error = %err, "Embedding unavailable, trying trigram fallback");
                self.trigram_lookup(phrase).await
            }
            Err(err) => Err(err),
        }
    }

    async fn description_for(&self, drg_code: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT drg_description FROM drg_procedures WHERE drg_code = $1",
        )
        .bind(drg_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::ExecutionError(format!("DRG description lookup failed: {}", e)))?;

        Ok(row.map(|(description,)| description))
    }
}
