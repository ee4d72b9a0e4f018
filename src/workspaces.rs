use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::billing::models::LimitField;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::extractor::{Actor, ActorBusiness};
use crate::mailer::Mailer;
use crate::pipeline;
use crate::store::{PageEnvelope, PageRequest, Repository, Scope};
use crate::tenancy::{self, Business, User, Workspace, BUSINESS_SCHEMA, ROLE_USER};

/// key: workspaces-api -> members, invitations, businesses

pub fn routes() -> Router {
    Router::new()
        .route("/v1/users/me", get(me))
        .route("/v1/workspaces", get(get_workspace).patch(rename_workspace))
        .route("/v1/workspaces/members", get(list_members))
        .route("/v1/workspaces/members/:id/disable", post(disable_member))
        .route(
            "/v1/workspaces/invitations",
            get(list_invitations).post(create_invitation),
        )
        .route("/v1/invitations/accept", post(accept_invitation))
        .route(
            "/v1/workspaces/businesses",
            get(list_businesses).post(create_business),
        )
        .route(
            "/v1/businesses/:business_descriptor",
            get(get_business).patch(update_business),
        )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user: User,
    pub workspace: Workspace,
}

async fn me(Extension(pool): Extension<PgPool>, actor: Actor) -> AppResult<Json<MeResponse>> {
    let workspace = sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = $1")
        .bind(actor.workspace_id)
        .fetch_one(&pool)
        .await
        .map_err(AppError::from)?;
    Ok(Json(MeResponse {
        user: actor.user,
        workspace,
    }))
}

async fn get_workspace(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
) -> AppResult<Json<Workspace>> {
    let workspace = sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = $1")
        .bind(actor.workspace_id)
        .fetch_one(&pool)
        .await
        .map_err(AppError::from)?;
    Ok(Json(workspace))
}

#[derive(Deserialize)]
pub struct RenameWorkspaceRequest {
    pub name: String,
}

async fn rename_workspace(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
    Json(payload): Json<RenameWorkspaceRequest>,
) -> AppResult<Json<Workspace>> {
    pipeline::requires(&actor, "manage", "workspaces")?;
    if payload.name.trim().is_empty() {
        return Err(AppError::validation(
            "workspace.invalid_name",
            "workspace name is required",
        ));
    }
    let workspace = sqlx::query_as::<_, Workspace>(
        "UPDATE workspaces SET name = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(actor.workspace_id)
    .bind(payload.name.trim())
    .fetch_one(&pool)
    .await
    .map_err(AppError::from)?;
    Ok(Json(workspace))
}

async fn list_members(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
) -> AppResult<Json<Vec<User>>> {
    pipeline::requires(&actor, "view", "team")?;
    let members = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE workspace_id = $1 ORDER BY created_at ASC",
    )
    .bind(actor.workspace_id)
    .fetch_all(&pool)
    .await
    .map_err(AppError::from)?;
    Ok(Json(members))
}

async fn disable_member(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    pipeline::requires(&actor, "manage", "team")?;
    if id == actor.user.id {
        return Err(AppError::validation(
            "workspace.cannot_disable_self",
            "you cannot disable your own account",
        ));
    }
    let result = sqlx::query(
        "UPDATE users SET enabled = FALSE, updated_at = NOW() \
         WHERE id = $1 AND workspace_id = $2",
    )
    .bind(id)
    .bind(actor.workspace_id)
    .execute(&pool)
    .await
    .map_err(AppError::from)?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("tenant.not_found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct WorkspaceInvitation {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub email: String,
    pub status: String,
    pub token: String,
    pub invited_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

async fn list_invitations(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
) -> AppResult<Json<Vec<WorkspaceInvitation>>> {
    pipeline::requires(&actor, "view", "team")?;
    let invitations = sqlx::query_as::<_, WorkspaceInvitation>(
        "SELECT * FROM workspace_invitations WHERE workspace_id = $1 ORDER BY invited_at DESC",
    )
    .bind(actor.workspace_id)
    .fetch_all(&pool)
    .await
    .map_err(AppError::from)?;
    Ok(Json(invitations))
}

#[derive(Deserialize)]
pub struct CreateInvitationRequest {
    pub email: String,
}

/// Invitation creation is the canonical `maxTeamMembers` gate: the live
/// count is enabled members plus pending invitations.
async fn create_invitation(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(mailer): Extension<Arc<dyn Mailer>>,
    actor: Actor,
    Json(payload): Json<CreateInvitationRequest>,
) -> AppResult<(StatusCode, Json<WorkspaceInvitation>)> {
    pipeline::requires(&actor, "manage", "team")?;
    let email = payload.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(AppError::validation(
            "workspace.invalid_invite_email",
            "a valid invite email is required",
        ));
    }

    let gate = pipeline::requires_active_subscription(&pool, &config, actor.workspace_id).await?;
    let workspace_id = actor.workspace_id;
    let pool_for_count = pool.clone();
    pipeline::requires_plan_limit(&gate, LimitField::MaxTeamMembers, async move {
        let members: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users WHERE workspace_id = $1 AND enabled = TRUE",
        )
        .bind(workspace_id)
        .fetch_one(&pool_for_count)
        .await
        .map_err(AppError::from)?;
        let pending: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workspace_invitations \
             WHERE workspace_id = $1 AND status = 'pending' AND expires_at > NOW()",
        )
        .bind(workspace_id)
        .fetch_one(&pool_for_count)
        .await
        .map_err(AppError::from)?;
        Ok(members.0 + pending.0)
    })
    .await?;

    let token = Uuid::new_v4().to_string();
    let invitation = sqlx::query_as::<_, WorkspaceInvitation>(
        "INSERT INTO workspace_invitations (id, workspace_id, invited_by, email, token, status, expires_at) \
         VALUES ($1, $2, $3, $4, $5, 'pending', $6) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(actor.workspace_id)
    .bind(actor.user.id)
    .bind(&email)
    .bind(&token)
    .bind(Utc::now() + Duration::seconds(config.auth.invitation_token_ttl_seconds))
    .fetch_one(&pool)
    .await
    .map_err(AppError::from)?;

    let base = config.http.base_url.trim_end_matches('/');
    if let Err(err) = mailer
        .send(
            &email,
            "You have been invited to a Kyora workspace",
            &format!("Accept your invitation: {base}/invitations/accept?token={token}"),
        )
        .await
    {
        tracing::warn!(?err, "failed to deliver invitation email");
    }

    Ok((StatusCode::CREATED, Json(invitation)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptInvitationRequest {
    pub token: String,
    pub full_name: String,
    pub password: String,
}

/// Public endpoint: the token is the credential. Creates the member account
/// and consumes the invitation in one transaction.
async fn accept_invitation(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<AcceptInvitationRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    if payload.password.len() < 8 {
        return Err(AppError::validation(
            "auth.weak_password",
            "password must be at least 8 characters",
        ));
    }
    if payload.full_name.trim().is_empty() {
        return Err(AppError::validation(
            "workspace.invalid_name",
            "full name is required",
        ));
    }

    let mut tx = pool.begin().await.map_err(AppError::from)?;
    let invitation = sqlx::query_as::<_, WorkspaceInvitation>(
        "SELECT * FROM workspace_invitations WHERE token = $1 FOR UPDATE",
    )
    .bind(&payload.token)
    .fetch_optional(&mut *tx)
    .await
    .map_err(AppError::from)?
    .ok_or(AppError::not_found("workspace.invitation_not_found"))?;

    if invitation.status != "pending" {
        return Err(AppError::conflict(
            "workspace.invitation_processed",
            "the invitation was already processed",
        ));
    }
    if invitation.expires_at < Utc::now() {
        return Err(AppError::validation(
            "workspace.invitation_expired",
            "the invitation has expired",
        ));
    }

    let salt = SaltString::generate(&mut rand_core::OsRng);
    let hash = Argon2::default()
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|err| AppError::Internal(anyhow::anyhow!("hashing failed: {err}")))?
        .to_string();

    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users \
         (id, workspace_id, email, full_name, password_hash, role, enabled, email_verified, identity_provider) \
         VALUES ($1, $2, $3, $4, $5, $6, TRUE, TRUE, 'password') RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(invitation.workspace_id)
    .bind(&invitation.email)
    .bind(payload.full_name.trim())
    .bind(hash)
    .bind(ROLE_USER)
    .fetch_one(&mut *tx)
    .await
    .map_err(AppError::from)?;

    sqlx::query(
        "UPDATE workspace_invitations SET status = 'accepted', accepted_at = NOW() WHERE id = $1",
    )
    .bind(invitation.id)
    .execute(&mut *tx)
    .await
    .map_err(AppError::from)?;

    tx.commit().await.map_err(AppError::from)?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Deserialize)]
pub struct CreateBusinessRequest {
    pub name: String,
    pub descriptor: String,
    pub country: String,
    pub currency: String,
}

async fn create_business(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    actor: Actor,
    Json(payload): Json<CreateBusinessRequest>,
) -> AppResult<(StatusCode, Json<Business>)> {
    pipeline::requires(&actor, "manage", "businesses")?;
    if payload.name.trim().is_empty() {
        return Err(AppError::validation(
            "business.invalid_name",
            "business name is required",
        ));
    }
    tenancy::validate_descriptor(&payload.descriptor)?;

    let gate = pipeline::requires_active_subscription(&pool, &config, actor.workspace_id).await?;
    let workspace_id = actor.workspace_id;
    let pool_for_count = pool.clone();
    pipeline::requires_plan_limit(&gate, LimitField::MaxBusinesses, async move {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM businesses WHERE workspace_id = $1")
                .bind(workspace_id)
                .fetch_one(&pool_for_count)
                .await
                .map_err(AppError::from)?;
        Ok(count.0)
    })
    .await?;

    let business = sqlx::query_as::<_, Business>(
        "INSERT INTO businesses (id, workspace_id, descriptor, name, country, currency) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(actor.workspace_id)
    .bind(&payload.descriptor)
    .bind(payload.name.trim())
    .bind(payload.country.trim().to_uppercase())
    .bind(payload.currency.trim().to_uppercase())
    .fetch_one(&pool)
    .await
    .map_err(AppError::from)?;
    Ok((StatusCode::CREATED, Json(business)))
}

async fn list_businesses(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<PageEnvelope<Business>>> {
    pipeline::requires(&actor, "view", "businesses")?;
    let repo = Repository::<Business>::new(pool, &BUSINESS_SCHEMA);
    let envelope = repo
        .list(&[Scope::Workspace(actor.workspace_id)], &[], &page)
        .await?;
    Ok(Json(envelope))
}

async fn get_business(scoped: ActorBusiness) -> AppResult<Json<Business>> {
    pipeline::requires(&scoped.actor, "view", "businesses")?;
    Ok(Json(scoped.business))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBusinessRequest {
    pub name: Option<String>,
    pub country: Option<String>,
    pub currency: Option<String>,
    pub safety_buffer: Option<Decimal>,
    pub fee_percent: Option<Decimal>,
    pub fee_fixed: Option<Decimal>,
}

async fn update_business(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Json(payload): Json<UpdateBusinessRequest>,
) -> AppResult<Json<Business>> {
    pipeline::requires(&scoped.actor, "manage", "businesses")?;
    for value in [payload.safety_buffer, payload.fee_percent, payload.fee_fixed]
        .into_iter()
        .flatten()
    {
        if value < Decimal::ZERO {
            return Err(AppError::validation(
                "business.invalid_amount",
                "monetary settings cannot be negative",
            ));
        }
    }

    let business = sqlx::query_as::<_, Business>(
        "UPDATE businesses SET \
           name = COALESCE($3, name), \
           country = COALESCE($4, country), \
           currency = COALESCE($5, currency), \
           safety_buffer = COALESCE($6, safety_buffer), \
           fee_percent = COALESCE($7, fee_percent), \
           fee_fixed = COALESCE($8, fee_fixed), \
           updated_at = NOW() \
         WHERE id = $1 AND workspace_id = $2 RETURNING *",
    )
    .bind(scoped.business.id)
    .bind(scoped.actor.workspace_id)
    .bind(payload.name.as_deref().map(str::trim))
    .bind(payload.country.as_deref().map(|c| c.trim().to_uppercase()))
    .bind(payload.currency.as_deref().map(|c| c.trim().to_uppercase()))
    .bind(payload.safety_buffer)
    .bind(payload.fee_percent)
    .bind(payload.fee_fixed)
    .fetch_one(&pool)
    .await
    .map_err(AppError::from)?;
    Ok(Json(business))
}
