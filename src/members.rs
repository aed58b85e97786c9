use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{self, LoginResponse, User, UserInfo};
use crate::billing;
use crate::error::{AppError, AppResult};
use crate::extractor::Actor;
use crate::mail::{templates, Mailer};
use crate::policy::{authorize, Action, Resource, Role};
use crate::tokens::{self, Purpose};
use crate::validate::Check;

pub async fn list_members(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
) -> AppResult<Json<Vec<UserInfo>>> {
    authorize(actor.role, Resource::Workspace, Action::Read)?;
    let members = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE workspace_id = $1 ORDER BY created_at ASC",
    )
    .bind(actor.workspace_id)
    .fetch_all(&pool)
    .await?;
    Ok(Json(members.iter().map(UserInfo::from).collect()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub email: String,
    pub role: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteResponse {
    pub email: String,
    pub role: String,
}

/// Mails a single-use invitation token bound to (workspace, email, role).
pub async fn invite_member(
    Extension(pool): Extension<PgPool>,
    Extension(mailer): Extension<Arc<dyn Mailer>>,
    actor: Actor,
    Json(payload): Json<InviteRequest>,
) -> AppResult<(StatusCode, Json<InviteResponse>)> {
    authorize(actor.role, Resource::Workspace, Action::Manage)?;
    let mut check = Check::new();
    check
        .require_email("email", &payload.email)
        .require(
            "role",
            matches!(Role::parse(&payload.role), Some(Role::Admin | Role::Staff)),
            "must be admin or staff",
        );
    check.finish()?;
    let email = payload.email.trim().to_lowercase();

    let member_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE workspace_id = $1")
            .bind(actor.workspace_id)
            .fetch_one(&pool)
            .await?;
    billing::check_limit(&pool, actor.workspace_id, "max_members", member_count, 1).await?;

    let exists: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM users WHERE workspace_id = $1 AND lower(email) = $2",
    )
    .bind(actor.workspace_id)
    .bind(&email)
    .fetch_optional(&pool)
    .await?;
    if exists.is_some() {
        return Err(AppError::Conflict("user is already a member".into()));
    }

    let token = tokens::issue_action_token(
        &pool,
        Purpose::Invitation,
        None,
        Some(actor.workspace_id),
        json!({ "email": email.clone(), "role": payload.role.clone() }),
    )
    .await?;
    mailer
        .send(templates::invitation(&email, "your workspace", &token))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(InviteResponse {
            email,
            role: payload.role,
        }),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptInvitationRequest {
    pub token: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

/// Redeems an invitation: creates the user in the inviting workspace and
/// logs them straight in.
pub async fn accept_invitation(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<AcceptInvitationRequest>,
) -> AppResult<Json<LoginResponse>> {
    let mut check = Check::new();
    check
        .require_present("token", &payload.token)
        .require_present("firstName", &payload.first_name)
        .require_present("lastName", &payload.last_name)
        .require_min_len("password", &payload.password, 8);
    check.finish()?;

    let consumed = tokens::consume_action_token(&pool, Purpose::Invitation, &payload.token).await?;
    let workspace_id = consumed.workspace_id.ok_or(AppError::Unauthorized)?;
    let email = consumed.payload["email"]
        .as_str()
        .ok_or(AppError::Unauthorized)?
        .to_string();
    let role = consumed.payload["role"].as_str().unwrap_or("staff").to_string();

    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (id, workspace_id, email, password_hash, first_name, last_name, \
         role, email_verified) VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(&email)
    .bind(auth::hash_password(&payload.password)?)
    .bind(payload.first_name.trim())
    .bind(payload.last_name.trim())
    .bind(&role)
    .fetch_one(&pool)
    .await?;

    let pair = auth::issue_session(&pool, &user).await?;
    Ok(Json(LoginResponse {
        user: UserInfo::from(&user),
        token: pair.token,
        refresh_token: pair.refresh_token,
    }))
}
