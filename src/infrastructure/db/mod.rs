//! PostgreSQL connection handling and row conversion.

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row};
use std::time::Duration;
use tracing::info;

use crate::domain::entities::ResultRow;
use crate::domain::error::{AppError, Result};

/// Pool sizing and timeout knobs for the engine's single database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
        }
    }
}

/// Connect a bounded pool to the configured database.
pub async fn init_pool(database_url: &str, config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(database_url)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to connect to database: {}", e)))?;

    info!(max_connections = config.max_connections, "Database pool ready");
    Ok(pool)
}

/// Convert one Postgres row into a JSON map keyed by column name.
pub fn row_to_json(row: &PgRow) -> ResultRow {
    let mut map = ResultRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), extract_column_value(row, i));
    }
    map
}

/// Extract a column value as JSON, probing types in order of likelihood.
fn extract_column_value(row: &PgRow, index: usize) -> serde_json::Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v
            .map(|n| serde_json::Value::Number(n.into()))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return v
            .map(|n| serde_json::Value::Number(n.into()))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bigdecimal::BigDecimal>, _>(index) {
        // NUMERIC columns (costs, ratings) come back as BigDecimal
        return v
            .and_then(|d| {
                use bigdecimal::ToPrimitive;
                d.to_f64()
            })
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v
            .map(serde_json::Value::Bool)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
        return v
            .map(|dt| serde_json::Value::String(dt.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return v
            .map(|d| serde_json::Value::String(d.to_string()))
            .unwrap_or(serde_json::Value::Null);
    }

    serde_json::Value::Null
}
