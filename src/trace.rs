use axum::{
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Clone)]
pub struct RequestContext {
    pub id: Uuid,
    pub path: String,
}

tokio::task_local! {
    static REQUEST: RequestContext;
}

/// Trace id of the request being served, if any. Carried into event payloads.
pub fn request_id() -> Option<Uuid> {
    REQUEST.try_with(|ctx| ctx.id).ok()
}

/// `instance` value for problem bodies: the request path plus its trace id.
pub fn problem_instance() -> String {
    REQUEST
        .try_with(|ctx| format!("{} ({})", ctx.path, ctx.id))
        .unwrap_or_else(|_| "about:blank".to_string())
}

/// Assigns a request id, scopes it for the duration of the request, and
/// echoes it back in `x-request-id`.
pub async fn request_context<B>(req: Request<B>, next: Next<B>) -> Response {
    let ctx = RequestContext {
        id: Uuid::new_v4(),
        path: req.uri().path().to_string(),
    };
    let id = ctx.id;
    let span = tracing::info_span!("request", request_id = %id, path = %ctx.path);
    let mut response = REQUEST.scope(ctx, next.run(req)).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Global request deadline. Handlers that outlive it are dropped at their
/// next suspension point and the client gets an internal problem.
pub async fn request_timeout<B>(req: Request<B>, next: Next<B>) -> Response {
    let deadline = std::time::Duration::from_secs(*crate::config::REQUEST_TIMEOUT_SECS);
    match tokio::time::timeout(deadline, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(timeout_secs = deadline.as_secs(), "request exceeded deadline");
            AppError::Message("request timed out".into()).into_response()
        }
    }
}

/// Converts handler panics into an internal-server problem instead of tearing
/// down the connection.
pub async fn recover<B>(req: Request<B>, next: Next<B>) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(&panic);
            tracing::error!(panic = %message, "handler panicked");
            AppError::Message(format!("panic: {message}")).into_response()
        }
    }
}

pub fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
