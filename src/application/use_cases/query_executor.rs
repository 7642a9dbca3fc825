//! Read-only execution of validated SQL.

use std::time::Duration;

use sqlx::PgPool;
use tracing::{debug, warn};

use crate::domain::entities::ResultRow;
use crate::domain::error::{AppError, Result};
use crate::infrastructure::db::row_to_json;

pub struct QueryExecutor {
    pool: PgPool,
}

impl QueryExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Execute `sql` inside a read-only transaction, bounded by
    /// `max_rows` and `timeout`. A missing LIMIT is injected. On any
    /// error the transaction rolls back and the driver message surfaces
    /// verbatim for the orchestrator to log and classify.
    pub async fn execute(
        &self,
        sql: &str,
        max_rows: i64,
        timeout: Duration,
    ) -> Result<Vec<ResultRow>> {
        let bounded_sql = Self::ensure_limit(sql, max_rows);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::ExecutionError(format!("Failed to open transaction: {}", e)))?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::ExecutionError(format!("Failed to set read-only: {}", e)))?;

        let fetched = tokio::time::timeout(timeout, sqlx::query(&bounded_sql).fetch_all(&mut *tx))
            .await;

        let rows = match fetched {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                let _ = tx.rollback().await;
                warn!(error = %e, "Query execution failed");
                return Err(AppError::ExecutionError(e.to_string()));
            }
            Err(_) => {
                let _ = tx.rollback().await;
                return Err(AppError::ExecutionError(format!(
                    "Query timed out after {} ms",
                    timeout.as_millis()
                )));
            }
        };

        // Nothing was written; closing out the transaction either way.
        let _ = tx.rollback().await;

        debug!(rows = rows.len(), "Query executed");
        Ok(rows.iter().map(row_to_json).collect())
    }

    /// Append `LIMIT max_rows` when the statement has none.
    fn ensure_limit(sql: &str, max_rows: i64) -> String {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if trimmed.to_lowercase().contains("limit") {
            trimmed.to_string()
        } else {
            format!("{} LIMIT {}", trimmed, max_rows)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_injected_when_absent() {
        let sql = QueryExecutor::ensure_limit("SELECT provider_name FROM providers", 1000);
        assert!(sql.ends_with("LIMIT 1000"));
    }

    #[test]
    fn test_existing_limit_kept() {
        let sql = QueryExecutor::ensure_limit("SELECT provider_name FROM providers LIMIT 5;", 1000);
        assert!(sql.ends_with("LIMIT 5"));
        assert!(!sql.contains("1000"));
    }

    #[test]
    fn test_trailing_semicolon_stripped() {
        let sql = QueryExecutor::ensure_limit("SELECT provider_name FROM providers;", 100);
        assert!(!sql.contains(';'));
    }
}
