use futures_util::future::BoxFuture;
use rand_core::{OsRng, RngCore};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::error::{AppError, AppResult};

/// Postgres sqlstates worth retrying under contention.
const RETRYABLE_SQLSTATES: [&str; 3] = ["40001", "40P01", "55P03"];

const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 2_000;

pub async fn connect(dsn: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(*config::DB_MAX_CONNECTIONS)
        .min_connections(*config::DB_MIN_CONNECTIONS)
        .idle_timeout(Duration::from_secs(*config::DB_IDLE_TIMEOUT_SECS))
        .connect(dsn)
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    fn set_sql(self) -> Option<&'static str> {
        match self {
            Isolation::Default => None,
            Isolation::ReadCommitted => {
                Some("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            }
            Isolation::RepeatableRead => {
                Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            }
            Isolation::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
        }
    }
}

/// Options for one atomic execution. `retries` is the total attempt budget.
#[derive(Clone, Default)]
pub struct ExecOptions {
    pub isolation: Isolation,
    pub retries: u32,
    pub read_only: bool,
    /// Invoked before each retry sleep with the attempt number just failed.
    pub on_retry: Option<Arc<dyn Fn(u32) + Send + Sync>>,
}

impl ExecOptions {
    pub fn serializable() -> Self {
        ExecOptions {
            isolation: Isolation::Serializable,
            ..Default::default()
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Runs `f` inside a transaction, applying the requested isolation level and
/// read-only mode, retrying serialization failures with capped exponential
/// backoff and jitter. Non-retryable errors return immediately; the last
/// error returns once the budget is spent.
pub async fn exec<T, F>(pool: &PgPool, opts: ExecOptions, mut f: F) -> AppResult<T>
where
    T: Send,
    F: for<'c> FnMut(&'c mut Transaction<'static, Postgres>) -> BoxFuture<'c, AppResult<T>>
        + Send,
{
    let budget = if opts.retries == 0 { 3 } else { opts.retries };
    let mut attempt: u32 = 0;
    loop {
        let outcome = run_once(pool, &opts, &mut f).await;
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= budget || !is_retryable_app(&err) {
                    return Err(err);
                }
                if let Some(hook) = &opts.on_retry {
                    hook(attempt);
                }
                tokio::time::sleep(backoff_with_jitter(attempt - 1)).await;
            }
        }
    }
}

async fn run_once<T, F>(pool: &PgPool, opts: &ExecOptions, f: &mut F) -> AppResult<T>
where
    T: Send,
    F: for<'c> FnMut(&'c mut Transaction<'static, Postgres>) -> BoxFuture<'c, AppResult<T>>
        + Send,
{
    let mut tx = pool.begin().await?;
    if let Some(sql) = opts.isolation.set_sql() {
        sqlx::query(sql).execute(&mut *tx).await?;
    }
    if opts.read_only {
        sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
    }
    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            // Rollback failures are expected after serialization errors.
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}

fn is_retryable_app(err: &AppError) -> bool {
    match err {
        AppError::Db(e) => is_retryable(e),
        _ => false,
    }
}

/// Serialization failure, deadlock, or lock-not-available, matched on the
/// database error code with a trailing `SQLSTATE <code>` fallback for
/// wrapped errors.
pub fn is_retryable(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        if let Some(code) = db.code() {
            if RETRYABLE_SQLSTATES.contains(&code.as_ref()) {
                return true;
            }
        }
    }
    let message = err.to_string();
    RETRYABLE_SQLSTATES
        .iter()
        .any(|code| message.trim_end().ends_with(&format!("SQLSTATE {code}")))
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        if db.code().as_deref() == Some("23505") {
            return true;
        }
    }
    err.to_string()
        .contains("duplicate key value violates unique constraint")
}

pub fn is_not_found(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::RowNotFound)
}

/// `50ms * 2^i`, capped at 2s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(exp.min(BACKOFF_CAP_MS))
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = backoff_delay(attempt);
    let half = (base.as_millis() as u64) / 2;
    let jitter = if half == 0 {
        0
    } else {
        OsRng.next_u64() % (half + 1)
    };
    base + Duration::from_millis(jitter)
}
