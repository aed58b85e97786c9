use axum::{middleware, routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use souk::blob::BlobStore;
use souk::bus::EventBus;
use souk::cache::Cache;
use souk::mail::Mailer;
use souk::oauth::GoogleOAuth;
use souk::payments::{HttpPaymentProvider, PaymentProvider};
use souk::rate_limit::RateLimiter;
use souk::routes::api_routes;
use souk::{blob, config, db, mail, onboarding, orders, search, trace};

async fn root() -> &'static str {
    "souk API"
}

const CUSTOMER_SEARCH_EXPR: &str =
    "to_tsvector('simple', coalesce(name, '') || ' ' || coalesce(email, '') || ' ' || coalesce(notes, ''))";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing.
    let _ = config::JWT_SECRET.as_str();
    tracing::info!(configured = ?config::startup_summary(), "configuration loaded");

    let pool: PgPool = db::connect(config::DATABASE_URL.as_str()).await?;
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    // Idempotent search DDL; migrations seed it, this keeps drift out.
    search::ensure_tsvector_column(&pool, "customers", "search", CUSTOMER_SEARCH_EXPR).await?;
    search::ensure_gin_index(&pool, "customers", "search").await?;
    search::ensure_trigram_gin_index(&pool, "customers", "name").await?;

    let bus = EventBus::new();
    let cache = Cache::new();
    cache.spawn_sweeper(Duration::from_secs(60));
    let limiter: Arc<RateLimiter> = RateLimiter::from_config();
    let mailer: Arc<dyn Mailer> = mail::from_config();
    let oauth: Arc<GoogleOAuth> = GoogleOAuth::from_config();
    let payment: Arc<dyn PaymentProvider> = HttpPaymentProvider::from_config();
    let blob_store: Option<Arc<dyn BlobStore>> = blob::from_config();
    if blob_store.is_none() {
        tracing::warn!("blob provider not configured; asset APIs will reject requests");
    }

    onboarding::spawn_subscribers(&bus, Arc::clone(&mailer));
    orders::spawn_subscribers(&bus, pool.clone());
    onboarding::spawn_session_reaper(pool.clone());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(middleware::from_fn(trace::recover))
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(Arc::clone(&bus)))
        .layer(Extension(cache))
        .layer(Extension(limiter))
        .layer(Extension(mailer))
        .layer(Extension(oauth))
        .layer(Extension(payment))
        .layer(Extension(blob_store))
        .layer(middleware::from_fn(trace::request_timeout))
        .layer(middleware::from_fn(trace::request_context));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Drain in-flight events before the process exits.
    bus.close().await;
    Ok(())
}
