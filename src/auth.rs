use std::sync::Arc;

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::extractor::{issue_access_token, Actor, AUTH_COOKIE};
use crate::mailer::Mailer;
use crate::oauth::GoogleOauthClient;
use crate::tenancy::{self, User};

/// key: auth-api -> login, refresh, password reset, email verification

pub fn routes() -> Router {
    Router::new()
        .route("/v1/auth/login", post(login))
        .route("/v1/auth/refresh", post(refresh))
        .route("/v1/auth/logout", post(logout))
        .route("/v1/auth/forgot-password", post(forgot_password))
        .route("/v1/auth/reset-password", post(reset_password))
        .route("/v1/auth/verify-email/request", post(request_email_verification))
        .route("/v1/auth/verify-email/confirm", post(confirm_email_verification))
        .route("/v1/auth/google-url", get(google_url))
        .route("/v1/auth/google-login", post(google_login))
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

async fn issue_token_pair(
    pool: &PgPool,
    config: &Config,
    user: &User,
) -> AppResult<(TokenPair, HeaderMap)> {
    let access_token = issue_access_token(&config.auth.jwt, user.id, user.workspace_id)?;
    let refresh_token = random_token();
    sqlx::query(
        "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(hash_token(&refresh_token))
    .bind(Utc::now() + Duration::seconds(config.auth.refresh_token_ttl_seconds))
    .execute(pool)
    .await
    .map_err(AppError::from)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        format!(
            "{AUTH_COOKIE}={access_token}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={}",
            config.auth.jwt.expiry_seconds
        )
        .parse()
        .expect("valid header value"),
    );

    Ok((
        TokenPair {
            access_token,
            refresh_token,
            expires_in: config.auth.jwt.expiry_seconds,
        },
        headers,
    ))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

async fn login(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<(HeaderMap, Json<TokenPair>)> {
    let email = payload.email.trim().to_lowercase();
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&pool)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::Unauthenticated)?;
    if !user.enabled {
        return Err(AppError::Unauthenticated);
    }

    let stored = user
        .password_hash
        .as_deref()
        .ok_or(AppError::Unauthenticated)?;
    let parsed = PasswordHash::new(stored).map_err(|err| {
        warn!(?err, "stored password hash failed to parse");
        AppError::Unauthenticated
    })?;
    if Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(AppError::Unauthenticated);
    }

    let (pair, headers) = issue_token_pair(&pool, &config, &user).await?;
    Ok((headers, Json(pair)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Rotate: the presented token is revoked and a fresh pair is issued.
async fn refresh(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<(HeaderMap, Json<TokenPair>)> {
    let row: Option<(Uuid, Uuid)> = sqlx::query_as(
        "UPDATE refresh_tokens SET revoked_at = NOW() \
         WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > NOW() \
         RETURNING id, user_id",
    )
    .bind(hash_token(&payload.refresh_token))
    .fetch_optional(&pool)
    .await
    .map_err(AppError::from)?;
    let (_, user_id) = row.ok_or(AppError::Unauthenticated)?;

    let user = tenancy::find_user(&pool, user_id)
        .await?
        .filter(|u| u.enabled)
        .ok_or(AppError::Unauthenticated)?;
    let (pair, headers) = issue_token_pair(&pool, &config, &user).await?;
    Ok((headers, Json(pair)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

async fn logout(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<LogoutRequest>,
) -> AppResult<(HeaderMap, StatusCode)> {
    if let Some(token) = payload.refresh_token.as_deref() {
        sqlx::query("UPDATE refresh_tokens SET revoked_at = NOW() WHERE token_hash = $1")
            .bind(hash_token(token))
            .execute(&pool)
            .await
            .map_err(AppError::from)?;
    }
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        format!("{AUTH_COOKIE}=deleted; HttpOnly; Path=/; Max-Age=0")
            .parse()
            .expect("valid header value"),
    );
    Ok((headers, StatusCode::NO_CONTENT))
}

#[derive(Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

/// Always 202; whether the email exists is not observable.
async fn forgot_password(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(mailer): Extension<Arc<dyn Mailer>>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> AppResult<StatusCode> {
    let email = payload.email.trim().to_lowercase();
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&pool)
        .await
        .map_err(AppError::from)?;

    if let Some(user) = user {
        let token = random_token();
        sqlx::query(
            "INSERT INTO auth_tokens (id, user_id, purpose, token_hash, expires_at) \
             VALUES ($1, $2, 'password_reset', $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(user.id)
        .bind(hash_token(&token))
        .bind(Utc::now() + Duration::seconds(config.auth.password_reset_ttl_seconds))
        .execute(&pool)
        .await
        .map_err(AppError::from)?;

        let base = config.http.base_url.trim_end_matches('/');
        if let Err(err) = mailer
            .send(
                &email,
                "Reset your Kyora password",
                &format!("Reset your password: {base}/reset-password?token={token}"),
            )
            .await
        {
            warn!(?err, "failed to deliver password reset email");
        }
    }
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

async fn reset_password(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<ResetPasswordRequest>,
) -> AppResult<StatusCode> {
    if payload.password.len() < 8 {
        return Err(AppError::validation(
            "auth.weak_password",
            "password must be at least 8 characters",
        ));
    }
    let row: Option<(Uuid,)> = sqlx::query_as(
        "UPDATE auth_tokens SET consumed_at = NOW() \
         WHERE token_hash = $1 AND purpose = 'password_reset' \
           AND consumed_at IS NULL AND expires_at > NOW() \
         RETURNING user_id",
    )
    .bind(hash_token(&payload.token))
    .fetch_optional(&pool)
    .await
    .map_err(AppError::from)?;
    let (user_id,) = row.ok_or_else(|| {
        AppError::validation("auth.invalid_token", "the reset token is invalid or expired")
    })?;

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|err| AppError::Internal(anyhow::anyhow!("hashing failed: {err}")))?
        .to_string();
    sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
        .bind(user_id)
        .bind(hash)
        .execute(&pool)
        .await
        .map_err(AppError::from)?;
    // Every outstanding refresh token dies with the old password.
    sqlx::query("UPDATE refresh_tokens SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL")
        .bind(user_id)
        .execute(&pool)
        .await
        .map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn request_email_verification(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(mailer): Extension<Arc<dyn Mailer>>,
    actor: Actor,
) -> AppResult<StatusCode> {
    if actor.user.email_verified {
        return Ok(StatusCode::NO_CONTENT);
    }
    let token = random_token();
    sqlx::query(
        "INSERT INTO auth_tokens (id, user_id, purpose, token_hash, expires_at) \
         VALUES ($1, $2, 'verify_email', $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(actor.user.id)
    .bind(hash_token(&token))
    .bind(Utc::now() + Duration::seconds(config.auth.verify_email_ttl_seconds))
    .execute(&pool)
    .await
    .map_err(AppError::from)?;

    let base = config.http.base_url.trim_end_matches('/');
    if let Err(err) = mailer
        .send(
            &actor.user.email,
            "Verify your Kyora email",
            &format!("Confirm your email: {base}/verify-email?token={token}"),
        )
        .await
    {
        warn!(?err, "failed to deliver verification email");
    }
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub struct ConfirmEmailRequest {
    pub token: String,
}

async fn confirm_email_verification(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<ConfirmEmailRequest>,
) -> AppResult<StatusCode> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "UPDATE auth_tokens SET consumed_at = NOW() \
         WHERE token_hash = $1 AND purpose = 'verify_email' \
           AND consumed_at IS NULL AND expires_at > NOW() \
         RETURNING user_id",
    )
    .bind(hash_token(&payload.token))
    .fetch_optional(&pool)
    .await
    .map_err(AppError::from)?;
    let (user_id,) = row.ok_or_else(|| {
        AppError::validation(
            "auth.invalid_token",
            "the verification token is invalid or expired",
        )
    })?;
    sqlx::query("UPDATE users SET email_verified = TRUE, updated_at = NOW() WHERE id = $1")
        .bind(user_id)
        .execute(&pool)
        .await
        .map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleUrlResponse {
    pub auth_url: String,
}

async fn google_url(
    Extension(oauth): Extension<Arc<GoogleOauthClient>>,
) -> AppResult<Json<GoogleUrlResponse>> {
    let auth_url = oauth.auth_url(&random_token())?;
    Ok(Json(GoogleUrlResponse { auth_url }))
}

#[derive(Deserialize)]
pub struct GoogleLoginRequest {
    pub code: String,
}

async fn google_login(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(oauth): Extension<Arc<GoogleOauthClient>>,
    Json(payload): Json<GoogleLoginRequest>,
) -> AppResult<(HeaderMap, Json<TokenPair>)> {
    let identity = oauth.exchange_code(&payload.code).await?;
    let email = identity.email.trim().to_lowercase();
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&pool)
        .await
        .map_err(AppError::from)?
        .filter(|u| u.enabled)
        .ok_or(AppError::Unauthenticated)?;
    let (pair, headers) = issue_token_pair(&pool, &config, &user).await?;
    Ok((headers, Json(pair)))
}
