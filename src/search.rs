use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{Execute, PgPool};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::repo::{OrderBy, Scope};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Validates a possibly qualified (`table.column`) SQL identifier. User input
/// never reaches interpolation; this guards the server-side callers too.
pub fn valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .split('.')
            .all(|part| IDENTIFIER.is_match(part))
}

fn require_identifier(identifier: &str) -> AppResult<()> {
    if valid_identifier(identifier) {
        Ok(())
    } else {
        Err(AppError::Message(format!(
            "refusing unsafe identifier `{identifier}`"
        )))
    }
}

/// Idempotently adds a STORED generated tsvector column. `expr` is a
/// server-controlled expression, never user input.
pub async fn ensure_tsvector_column(
    pool: &PgPool,
    table: &str,
    column: &str,
    expr: &str,
) -> AppResult<()> {
    require_identifier(table)?;
    require_identifier(column)?;
    let sql = format!(
        "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {column} tsvector \
         GENERATED ALWAYS AS ({expr}) STORED"
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn ensure_gin_index(pool: &PgPool, table: &str, column: &str) -> AppResult<()> {
    require_identifier(table)?;
    require_identifier(column)?;
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_{column}_gin ON {table} USING GIN ({column})"
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn ensure_trigram_gin_index(pool: &PgPool, table: &str, column: &str) -> AppResult<()> {
    require_identifier(table)?;
    require_identifier(column)?;
    sqlx::query("CREATE EXTENSION IF NOT EXISTS pg_trgm")
        .execute(pool)
        .await?;
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_{column}_trgm ON {table} \
         USING GIN ({column} gin_trgm_ops)"
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// OR-combines `column @@ websearch_to_tsquery('simple', $term)` for each
/// validated column. Empty term or column list yields a no-op scope.
pub fn web_search_scope(term: &str, columns: &[&'static str]) -> Scope {
    let term = term.trim().to_string();
    let columns: Vec<&'static str> = columns
        .iter()
        .copied()
        .filter(|column| valid_identifier(column))
        .collect();
    Arc::new(move |qb| {
        if term.is_empty() || columns.is_empty() {
            return;
        }
        qb.push(" AND (");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push(format!("{column} @@ websearch_to_tsquery('simple', "));
            qb.push_bind(term.clone());
            qb.push(")");
        }
        qb.push(")");
    })
}

/// Orders by the summed `ts_rank_cd` of each column against the term, DESC.
pub fn web_search_rank_order(term: &str, columns: &[&'static str]) -> OrderBy {
    let term = term.trim().to_string();
    let columns: Vec<&'static str> = columns
        .iter()
        .copied()
        .filter(|column| valid_identifier(column))
        .collect();
    Arc::new(move |qb| {
        if term.is_empty() || columns.is_empty() {
            qb.push(" ORDER BY created_at DESC");
            return;
        }
        qb.push(" ORDER BY (");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                qb.push(" + ");
            }
            qb.push(format!("ts_rank_cd({column}, websearch_to_tsquery('simple', "));
            qb.push_bind(term.clone());
            qb.push("))");
        }
        qb.push(") DESC");
    })
}
