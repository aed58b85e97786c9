use futures_util::FutureExt;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use souk::db::{self, ExecOptions, Isolation};
use souk::error::AppError;

async fn seed_counter(pool: &PgPool) {
    sqlx::query("CREATE TABLE IF NOT EXISTS tx_counters (id INT PRIMARY KEY, value BIGINT NOT NULL)")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO tx_counters (id, value) VALUES (1, 0) ON CONFLICT (id) DO UPDATE SET value = 0")
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_serializable_increments_both_land(
    pool_opts: PgPoolOptions,
    connect_opts: PgConnectOptions,
) {
    // Both transactions must hold a connection at once.
    let pool = pool_opts
        .max_connections(4)
        .connect_with(connect_opts)
        .await
        .unwrap();
    seed_counter(&pool).await;
    let retries = Arc::new(AtomicU32::new(0));
    let opts = ExecOptions {
        isolation: Isolation::Serializable,
        retries: 5,
        read_only: false,
        on_retry: Some({
            let retries = Arc::clone(&retries);
            Arc::new(move |_attempt| {
                retries.fetch_add(1, Ordering::SeqCst);
            })
        }),
    };

    let increment = |pool: PgPool, opts: ExecOptions| async move {
        db::exec(&pool, opts, move |tx| {
            async move {
                let value: i64 = sqlx::query_scalar("SELECT value FROM tx_counters WHERE id = 1")
                    .fetch_one(&mut **tx)
                    .await?;
                // Widen the race window so the transactions overlap.
                tokio::time::sleep(Duration::from_millis(50)).await;
                sqlx::query("UPDATE tx_counters SET value = $1 WHERE id = 1")
                    .bind(value + 1)
                    .execute(&mut **tx)
                    .await?;
                Ok(())
            }
            .boxed()
        })
        .await
    };

    let (first, second) = tokio::join!(
        increment(pool.clone(), opts.clone()),
        increment(pool.clone(), opts.clone()),
    );
    first.expect("first increment");
    second.expect("second increment");

    let value: i64 = sqlx::query_scalar("SELECT value FROM tx_counters WHERE id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(value, 2);
    assert!(
        retries.load(Ordering::SeqCst) >= 1,
        "at least one transaction should have retried"
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn retry_budget_bounds_attempts(pool: PgPool) {
    let attempts = Arc::new(AtomicU32::new(0));
    let opts = ExecOptions::default().with_retries(3);
    let counting = Arc::clone(&attempts);
    let result: Result<(), _> = db::exec(&pool, opts, move |_tx| {
        counting.fetch_add(1, Ordering::SeqCst);
        async {
            Err(AppError::Db(sqlx::Error::Protocol(
                "could not serialize access: SQLSTATE 40001".into(),
            )))
        }
        .boxed()
    })
    .await;
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn non_retryable_errors_return_immediately(pool: PgPool) {
    let attempts = Arc::new(AtomicU32::new(0));
    let counting = Arc::clone(&attempts);
    let result: Result<(), _> = db::exec(&pool, ExecOptions::default().with_retries(5), move |_tx| {
        counting.fetch_add(1, Ordering::SeqCst);
        async { Err(AppError::Conflict("no retry for you".into())) }.boxed()
    })
    .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn read_only_transactions_reject_writes(pool: PgPool) {
    seed_counter(&pool).await;
    let opts = ExecOptions {
        read_only: true,
        ..Default::default()
    };
    let result: Result<(), _> = db::exec(&pool, opts, move |tx| {
        async move {
            sqlx::query("UPDATE tx_counters SET value = 9 WHERE id = 1")
                .execute(&mut **tx)
                .await?;
            Ok(())
        }
        .boxed()
    })
    .await;
    assert!(result.is_err());
    let value: i64 = sqlx::query_scalar("SELECT value FROM tx_counters WHERE id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(value, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn successful_exec_commits(pool: PgPool) {
    seed_counter(&pool).await;
    db::exec(&pool, ExecOptions::default(), move |tx| {
        async move {
            sqlx::query("UPDATE tx_counters SET value = value + 5 WHERE id = 1")
                .execute(&mut **tx)
                .await?;
            Ok(())
        }
        .boxed()
    })
    .await
    .expect("exec commits");
    let value: i64 = sqlx::query_scalar("SELECT value FROM tx_counters WHERE id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(value, 5);
}
