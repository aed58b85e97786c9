use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::{assets, auth, billing, customers, members, onboarding, orders, payments};

pub fn api_routes() -> Router {
    Router::new()
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/refresh", post(auth::refresh))
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/auth/logout-all", post(auth::logout_all))
        .route("/v1/auth/forgot-password", post(auth::forgot_password))
        .route("/v1/auth/reset-password", post(auth::reset_password))
        .route("/v1/auth/verify-email", post(auth::verify_email))
        .route("/v1/auth/google/login", post(auth::google_login))
        .route("/v1/auth/me", get(auth::me))
        .route("/v1/onboarding/start", post(onboarding::start))
        .route(
            "/v1/onboarding/session",
            get(onboarding::get_session).delete(onboarding::delete_session),
        )
        .route("/v1/onboarding/email/otp", post(onboarding::send_email_otp))
        .route("/v1/onboarding/email/verify", post(onboarding::verify_email))
        .route(
            "/v1/onboarding/oauth/google",
            post(onboarding::verify_oauth_google),
        )
        .route("/v1/onboarding/business", post(onboarding::stage_business))
        .route(
            "/v1/onboarding/payment/start",
            post(onboarding::start_payment),
        )
        .route("/v1/onboarding/complete", post(onboarding::complete))
        .route("/v1/webhooks/payments", post(payments::webhook))
        .route(
            "/v1/workspace/members",
            get(members::list_members).post(members::invite_member),
        )
        .route(
            "/v1/invitations/accept",
            post(members::accept_invitation),
        )
        .merge(billing::routes())
        .route(
            "/v1/businesses/:businessDescriptor/customers",
            get(customers::list).post(customers::create),
        )
        .route(
            "/v1/businesses/:businessDescriptor/customers/:id",
            get(customers::get)
                .patch(customers::patch)
                .delete(customers::delete),
        )
        .route(
            "/v1/businesses/:businessDescriptor/orders",
            get(orders::list).post(orders::create),
        )
        .route(
            "/v1/businesses/:businessDescriptor/orders/:id/payment-link",
            post(orders::create_payment_link),
        )
        .route(
            "/v1/businesses/:businessDescriptor/assets",
            get(assets::list),
        )
        .route(
            "/v1/businesses/:businessDescriptor/assets/presign",
            post(assets::presign),
        )
        .route(
            "/v1/businesses/:businessDescriptor/assets/confirm",
            post(assets::confirm),
        )
        .route(
            "/v1/businesses/:businessDescriptor/assets/:id",
            delete(assets::delete),
        )
        .route(
            "/v1/businesses/:businessDescriptor/assets/multipart/start",
            post(assets::multipart_start),
        )
        .route(
            "/v1/businesses/:businessDescriptor/assets/multipart/part",
            post(assets::multipart_part),
        )
        .route(
            "/v1/businesses/:businessDescriptor/assets/multipart/complete",
            post(assets::multipart_complete),
        )
        .route(
            "/v1/businesses/:businessDescriptor/assets/multipart/abort",
            post(assets::multipart_abort),
        )
}
