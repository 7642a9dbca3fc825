//! The SQL template catalog.
//!
//! Owns every `template_catalog` row: nearest-neighbour retrieval over
//! pgvector embeddings, edit-distance reranking into a blended
//! confidence, and insert-on-learn for successful novel queries.
//! Readers go straight to the index; writers serialize on one mutex and
//! insert inside a transaction.

use std::sync::Arc;

use pgvector::Vector;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::embedding_service::EmbeddingService;
use super::sql_normalizer::SqlNormalizer;
use crate::domain::entities::{Template, TemplateMatch};
use crate::domain::error::{AppError, Result};

/// Cosine similarity above which a new template counts as a duplicate.
const DUPLICATE_SIMILARITY: f64 = 0.95;

/// Candidates pulled for the rerank step.
const RERANK_CANDIDATES: i64 = 3;

pub struct TemplateStore {
    pool: PgPool,
    embedder: Arc<EmbeddingService>,
    normalizer: SqlNormalizer,
    similarity_floor: f64,
    write_lock: Mutex<()>,
}

impl TemplateStore {
    pub fn new(pool: PgPool, embedder: Arc<EmbeddingService>, similarity_floor: f64) -> Self {
        Self {
            pool,
            embedder,
            normalizer: SqlNormalizer::new(),
            similarity_floor,
            write_lock: Mutex::new(()),
        }
    }

    /// Nearest templates to `query_vec`, closest first, filtered by the
    /// cosine floor.
    pub async fn search(
        &self,
        query_vec: &[f32],
        k: i64,
        cosine_floor: f64,
    ) -> Result<Vec<TemplateMatch>> {
        let embedding = Vector::from(query_vec.to_vec());

        let rows = sqlx::query_as::<_, (i64, String, String, Option<String>, f64)>(
            r#"
            SELECT
                template_id,
                canonical_sql,
                raw_sql,
                comment,
                (1 - (embedding <=> $1::vector))::float8 AS similarity
            FROM template_catalog
            WHERE embedding IS NOT NULL
              AND (1 - (embedding <=> $1::vector))::float8 >= $2
            ORDER BY embedding <=> $1::vector
            LIMIT $3
            "#,
        )
        .bind(&embedding)
        .bind(cosine_floor)
        .bind(k)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::ExecutionError(format!("Template search failed: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(template_id, canonical_sql, raw_sql, comment, similarity)| {
                let similarity = similarity.clamp(0.0, 1.0);
                TemplateMatch {
                    template: Template {
                        template_id,
                        canonical_sql,
                        raw_sql,
                        comment: comment.unwrap_or_default(),
                        created_at: None,
                        updated_at: None,
                    },
                    similarity,
                    edit_distance: 0,
                    confidence: similarity,
                }
            })
            .collect())
    }

    /// Best template for a drafted query: vector candidates reranked by
    /// normalized Levenshtein distance against their canonical SQL.
    /// `preferred_params` breaks confidence ties toward templates whose
    /// placeholder count the caller can actually bind.
    pub async fn best_match(
        &self,
        query_vec: &[f32],
        query_sql: &str,
        confidence_floor: f64,
        preferred_params: Option<usize>,
    ) -> Result<Option<TemplateMatch>> {
        let mut candidates = self
            .search(query_vec, RERANK_CANDIDATES, self.similarity_floor)
            .await?;

        if candidates.is_empty() {
            debug!("No template candidates above the similarity floor");
            return Ok(None);
        }

        let query_lower = query_sql.to_lowercase();
        for candidate in &mut candidates {
            let distance = strsim::levenshtein(&query_lower, &candidate.template.canonical_sql);
            let max_len = query_lower
                .chars()
                .count()
                .max(candidate.template.canonical_sql.chars().count());
            candidate.edit_distance = distance;
            candidate.confidence = Self::blend_confidence(candidate.similarity, distance, max_len);
        }

        let best = Self::select_best(candidates, preferred_params);

        match best {
            Some(candidate) if candidate.confidence >= confidence_floor => {
                info!(
                    template_id = candidate.template.template_id,
                    similarity = candidate.similarity,
                    edit_distance = candidate.edit_distance,
                    confidence = candidate.confidence,
                    "Template match"
                );
                Ok(Some(candidate))
            }
            Some(candidate) => {
                debug!(
                    confidence = candidate.confidence,
                    floor = confidence_floor,
                    "Best template below the confidence floor"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Templates closest to a natural-language question, used as RAG
    /// exemplars. Only comment-bearing rows qualify.
    pub async fn suggestions(&self, question_vec: &[f32], k: i64) -> Result<Vec<TemplateMatch>> {
        let embedding = Vector::from(question_vec.to_vec());

        let rows = sqlx::query_as::<_, (i64, String, String, Option<String>, f64)>(
            r#"
            SELECT
                template_id,
                canonical_sql,
                raw_sql,
                comment,
                (1 - (embedding <=> $1::vector))::float8 AS similarity
            FROM template_catalog
            WHERE embedding IS NOT NULL
              AND comment IS NOT NULL
              AND comment != ''
            ORDER BY embedding <=> $1::vector
            LIMIT $2
            "#,
        )
        .bind(&embedding)
        .bind(k)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::ExecutionError(format!("Template suggestions failed: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(template_id, canonical_sql, raw_sql, comment, similarity)| TemplateMatch {
                template: Template {
                    template_id,
                    canonical_sql,
                    raw_sql,
                    comment: comment.unwrap_or_default(),
                    created_at: None,
                    updated_at: None,
                },
                similarity: similarity.clamp(0.0, 1.0),
                edit_distance: 0,
                confidence: similarity.clamp(0.0, 1.0),
            })
            .collect())
    }

    /// Learn a successful novel query. Returns the new template id, or
    /// `None` when a near-duplicate already exists. The insert runs in a
    /// transaction under the writer lock, so cancellation mid-learn
    /// leaves no partial row.
    pub async fn learn(
        &self,
        canonical_sql: &str,
        raw_sql: &str,
        comment: &str,
    ) -> Result<Option<i64>> {
        let _guard = self.write_lock.lock().await;

        let embedding = self.embedder.embed(&embedding_input(canonical_sql, comment)).await?;

        let duplicates = self.search(&embedding, 1, DUPLICATE_SIMILARITY).await?;
        if let Some(existing) = duplicates.first() {
            debug!(
                template_id = existing.template.template_id,
                "Similar template already cataloged, skipping learn"
            );
            return Ok(None);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::ExecutionError(format!("Failed to open transaction: {}", e)))?;

        let (template_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO template_catalog (canonical_sql, raw_sql, comment, embedding, created_at, updated_at)
            VALUES ($1, $2, $3, $4::vector, now(), now())
            RETURNING template_id
            "#,
        )
        .bind(canonical_sql)
        .bind(raw_sql)
        .bind(comment)
        .bind(Vector::from(embedding))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::ExecutionError(format!("Template insert failed: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| AppError::ExecutionError(format!("Template insert commit failed: {}", e)))?;

        info!(template_id, "Learned new template");
        Ok(Some(template_id))
    }

    /// Seed an empty catalog with the built-in healthcare patterns.
    /// Returns the number of templates inserted.
    pub async fn seed(&self) -> Result<u32> {
        let mut inserted = 0;
        for (raw_sql, comment) in SEED_TEMPLATES {
            let normalized = self.normalizer.normalize(raw_sql);
            if self
                .learn(&normalized.canonical_sql, raw_sql.trim(), comment)
                .await?
                .is_some()
            {
                inserted += 1;
            }
        }
        info!(inserted, "Template catalog seeded");
        Ok(inserted)
    }

    /// Catalog counts for diagnostics.
    pub async fn statistics(&self) -> Result<(i64, i64)> {
        let (total, embedded): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE embedding IS NOT NULL)
            FROM template_catalog
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::ExecutionError(format!("Catalog statistics failed: {}", e)))?;
        Ok((total, embedded))
    }

    /// 0.7·cosine + 0.3·(1 − edit/max_len), clamped to [0, 1].
    fn blend_confidence(similarity: f64, edit_distance: usize, max_len: usize) -> f64 {
        let edit_ratio = if max_len == 0 {
            0.0
        } else {
            1.0 - (edit_distance as f64 / max_len as f64)
        };
        (similarity * 0.7 + edit_ratio.max(0.0) * 0.3).clamp(0.0, 1.0)
    }

    /// Highest confidence wins; ties prefer a placeholder count equal to
    /// the caller's bindable field count, then the older template id.
    fn select_best(
        candidates: Vec<TemplateMatch>,
        preferred_params: Option<usize>,
    ) -> Option<TemplateMatch> {
        candidates.into_iter().reduce(|best, other| {
            let diff = other.confidence - best.confidence;
            if diff.abs() > f64::EPSILON * 8.0 {
                return if diff > 0.0 { other } else { best };
            }
            if let Some(preferred) = preferred_params {
                let best_fits = best.template.placeholder_count() == preferred;
                let other_fits = other.template.placeholder_count() == preferred;
                if best_fits != other_fits {
                    return if other_fits { other } else { best };
                }
            }
            if other.template.template_id < best.template.template_id {
                other
            } else {
                best
            }
        })
    }
}

/// Retrieval key fed to the embedder: the canonical SQL, and the comment
/// when one exists.
fn embedding_input(canonical_sql: &str, comment: &str) -> String {
    if comment.is_empty() {
        canonical_sql.to_string()
    } else {
        format!("{}\n{}", canonical_sql, comment)
    }
}

/// Built-in catalog patterns, recovered from the production seed set.
pub const SEED_TEMPLATES: &[(&str, &str)] = &[
    (
        r#"
        SELECT p.provider_name,
               pp.average_covered_charges,
               d.drg_description,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_description ILIKE $1
          AND p.provider_state = $2
        ORDER BY pp.average_covered_charges ASC
        LIMIT $3
        "#,
        "Cheapest providers for a procedure by description in a state",
    ),
    (
        r#"
        SELECT p.provider_name,
               pp.average_covered_charges,
               d.drg_description,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_code = $1
          AND p.provider_state = $2
        ORDER BY pp.average_covered_charges ASC
        LIMIT $3
        "#,
        "Cheapest providers for a DRG in a state",
    ),
    (
        r#"
        SELECT p.provider_name,
               pp.average_covered_charges,
               d.drg_description,
               p.provider_city,
               p.provider_state,
               pp.total_discharges
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_description ILIKE $1
        ORDER BY pp.average_covered_charges ASC
        LIMIT $2
        "#,
        "Cheapest providers nationwide for any procedure by description",
    ),
    (
        r#"
        SELECT p.provider_name,
               pp.average_covered_charges,
               d.drg_description,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_description ILIKE $1
          AND p.provider_city ILIKE $2
        ORDER BY pp.average_covered_charges ASC
        LIMIT $3
        "#,
        "Cheapest providers for a procedure in a city",
    ),
    (
        r#"
        SELECT p.provider_name,
               pp.average_covered_charges,
               d.drg_description,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_description ILIKE $1
          AND p.provider_state = $2
        ORDER BY pp.average_covered_charges DESC
        LIMIT $3
        "#,
        "Most expensive providers for a procedure by description in a state",
    ),
    (
        r#"
        SELECT d.drg_code,
               d.drg_description,
               AVG(pp.average_covered_charges) AS avg_cost,
               MAX(pp.average_covered_charges) AS max_cost,
               COUNT(*) AS provider_count
        FROM drg_procedures d
        JOIN provider_procedures pp ON d.drg_code = pp.drg_code
        JOIN providers p ON pp.provider_id = p.provider_id
        WHERE p.provider_state = $1
        GROUP BY d.drg_code, d.drg_description
        ORDER BY avg_cost DESC
        LIMIT $2
        "#,
        "Most expensive procedures in a state by average cost",
    ),
    (
        r#"
        SELECT p.provider_name,
               pr.overall_rating,
               pr.quality_rating,
               pr.safety_rating,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_ratings pr ON p.provider_id = pr.provider_id
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_description ILIKE $1
        ORDER BY pr.overall_rating DESC
        LIMIT $2
        "#,
        "Highest rated providers for a specific procedure",
    ),
    (
        r#"
        SELECT p.provider_name,
               pr.overall_rating,
               pr.quality_rating,
               pr.safety_rating,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_ratings pr ON p.provider_id = pr.provider_id
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_description ILIKE $1
          AND p.provider_state = $2
        ORDER BY pr.overall_rating DESC
        LIMIT $3
        "#,
        "Highest rated providers for a procedure in a state",
    ),
    (
        r#"
        SELECT p.provider_name,
               pr.overall_rating,
               pr.quality_rating,
               pr.safety_rating,
               pr.patient_experience_rating,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_ratings pr ON p.provider_id = pr.provider_id
        WHERE pr.overall_rating >= $1
          AND p.provider_state = $2
        ORDER BY pr.overall_rating DESC
        LIMIT $3
        "#,
        "Providers above rating threshold in a state",
    ),
    (
        r#"
        SELECT p.provider_name,
               pr.overall_rating,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_ratings pr ON p.provider_id = pr.provider_id
        WHERE p.provider_city ILIKE $1
        ORDER BY pr.overall_rating DESC
        LIMIT $2
        "#,
        "Highest-rated providers in a city",
    ),
    (
        r#"
        SELECT p.provider_name,
               pp.total_discharges,
               pp.average_covered_charges,
               d.drg_description,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE pp.drg_code = $1
        ORDER BY pp.total_discharges DESC
        LIMIT $2
        "#,
        "Volume leaders for a specific DRG code",
    ),
    (
        r#"
        SELECT p.provider_name,
               pp.total_discharges,
               pp.average_covered_charges,
               d.drg_description,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_description ILIKE $1
          AND p.provider_state = $2
        ORDER BY pp.total_discharges DESC
        LIMIT $3
        "#,
        "Volume leaders for a procedure in a state",
    ),
    (
        r#"
        SELECT p.provider_name,
               pp.average_covered_charges,
               pp.average_medicare_payments,
               (pp.average_covered_charges - pp.average_medicare_payments) AS patient_cost,
               d.drg_description,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        JOIN drg_procedures d ON pp.drg_code = d.drg_code
        WHERE d.drg_description ILIKE $1
          AND p.provider_state = $2
        ORDER BY patient_cost ASC
        LIMIT $3
        "#,
        "Lowest patient out-of-pocket costs for a procedure in a state",
    ),
    (
        r#"
        SELECT p.provider_name,
               p.provider_city,
               p.provider_state,
               p.provider_zip_code
        FROM providers p
        WHERE p.provider_zip_code LIKE $1
        LIMIT $2
        "#,
        "Providers near a ZIP-code prefix",
    ),
    (
        r#"
        SELECT p.provider_name,
               COUNT(DISTINCT pp.drg_code) AS procedure_count,
               AVG(pp.average_covered_charges) AS avg_cost,
               AVG(pr.overall_rating) AS avg_rating,
               p.provider_city,
               p.provider_state
        FROM providers p
        JOIN provider_procedures pp ON p.provider_id = pp.provider_id
        LEFT JOIN provider_ratings pr ON p.provider_id = pr.provider_id
        WHERE p.provider_state = $1
        GROUP BY p.provider_id, p.provider_name, p.provider_city, p.provider_state
        ORDER BY procedure_count DESC
        LIMIT $2
        "#,
        "Multi-procedure providers in a state ranked by variety",
    ),
    (
        r#"
        SELECT d.drg_code,
               d.drg_description,
               COUNT(*) AS provider_count,
               AVG(pp.average_covered_charges) AS avg_cost,
               MIN(pp.average_covered_charges) AS min_cost,
               MAX(pp.average_covered_charges) AS max_cost
        FROM drg_procedures d
        JOIN provider_procedures pp ON d.drg_code = pp.drg_code
        JOIN providers p ON pp.provider_id = p.provider_id
        WHERE p.provider_state = $1
        GROUP BY d.drg_code, d.drg_description
        ORDER BY avg_cost ASC
        LIMIT $2
        "#,
        "Most affordable procedures in a state with statistics",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Template;

    fn candidate(id: i64, raw_sql: &str, confidence: f64) -> TemplateMatch {
        TemplateMatch {
            template: Template {
                template_id: id,
                canonical_sql: raw_sql.to_lowercase(),
                raw_sql: raw_sql.to_string(),
                comment: String::new(),
                created_at: None,
                updated_at: None,
            },
            similarity: confidence,
            edit_distance: 0,
            confidence,
        }
    }

    #[test]
    fn test_blend_confidence() {
        // identical SQL: distance zero, full edit credit
        let c = TemplateStore::blend_confidence(1.0, 0, 40);
        assert!((c - 1.0).abs() < 1e-9);

        // no edit credit at all
        let c = TemplateStore::blend_confidence(0.8, 40, 40);
        assert!((c - 0.56).abs() < 1e-9);

        let c = TemplateStore::blend_confidence(0.9, 10, 100);
        assert!((c - (0.9 * 0.7 + 0.9 * 0.3)).abs() < 1e-9);
    }

    #[test]
    fn test_select_best_prefers_confidence() {
        let best = TemplateStore::select_best(
            vec![
                candidate(1, "select a from providers where x = $1", 0.8),
                candidate(2, "select a from providers where x = $1", 0.9),
            ],
            None,
        )
        .unwrap();
        assert_eq!(best.template.template_id, 2);
    }

    #[test]
    fn test_select_best_tie_breaks_on_placeholder_fit() {
        let best = TemplateStore::select_best(
            vec![
                candidate(1, "select a from providers where x = $1 and y = $2 limit $3", 0.85),
                candidate(2, "select a from providers where x = $1 limit $2", 0.85),
            ],
            Some(2),
        )
        .unwrap();
        assert_eq!(best.template.template_id, 2);
    }

    #[test]
    fn test_select_best_tie_breaks_on_age() {
        let best = TemplateStore::select_best(
            vec![
                candidate(7, "select a from providers limit $1", 0.85),
                candidate(3, "select b from providers limit $1", 0.85),
            ],
            None,
        )
        .unwrap();
        assert_eq!(best.template.template_id, 3);
    }

    #[test]
    fn test_seed_corpus_is_well_formed() {
        let normalizer = SqlNormalizer::new();
        for (raw_sql, comment) in SEED_TEMPLATES {
            assert!(!comment.is_empty());

            // placeholders form a contiguous set starting at $1
            let mut indices: Vec<usize> = regex::Regex::new(r"\$(\d+)")
                .unwrap()
                .captures_iter(raw_sql)
                .filter_map(|c| c[1].parse().ok())
                .collect();
            indices.sort();
            indices.dedup();
            assert!(!indices.is_empty(), "template without placeholders: {}", comment);
            assert_eq!(indices[0], 1, "placeholders must start at $1: {}", comment);
            assert_eq!(
                indices.len(),
                *indices.last().unwrap(),
                "placeholder gap in: {}",
                comment
            );

            // every seed parses and normalizes to a fixed point
            let normalized = normalizer.normalize(raw_sql);
            assert!(!normalized.parse_degraded, "seed does not parse: {}", comment);
            assert!(normalized.constants.is_empty(), "literal left in seed: {}", comment);
            let again = normalizer.normalize(&normalized.canonical_sql);
            assert_eq!(normalized.canonical_sql, again.canonical_sql);
        }
    }
}
