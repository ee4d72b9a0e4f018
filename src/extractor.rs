use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{Config, JwtConfig};
use crate::error::{AppError, AppResult};
use crate::tenancy::{self, Business, User};

pub const AUTH_COOKIE: &str = "kyora_token";

/// Wire-stable access-token claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(rename = "workspaceId")]
    pub workspace_id: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

pub fn issue_access_token(cfg: &JwtConfig, user_id: Uuid, workspace_id: Uuid) -> AppResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        workspace_id,
        iat: now.timestamp(),
        exp: now.timestamp() + cfg.expiry_seconds,
        iss: cfg.issuer.clone(),
        aud: cfg.audience.clone(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
    .map_err(|err| AppError::Internal(anyhow::anyhow!("token encoding failed: {err}")))
}

pub fn decode_access_token(cfg: &JwtConfig, token: &str) -> Result<Claims, AppError> {
    let mut validation = Validation::default();
    validation.set_issuer(&[cfg.issuer.as_str()]);
    validation.set_audience(&[cfg.audience.as_str()]);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthenticated)
}

fn bearer_or_cookie(parts: &Parts) -> Option<String> {
    if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        if let Some(token) = authz
            .to_str()
            .ok()
            .and_then(|s| s.strip_prefix("Bearer "))
        {
            return Some(token.to_string());
        }
    }
    let cookie_header = parts.headers.get(axum::http::header::COOKIE)?;
    let cookies = cookie_header.to_str().unwrap_or("");
    cookies.split(';').find_map(|c| {
        c.trim()
            .strip_prefix(&format!("{AUTH_COOKIE}="))
            .map(|s| s.to_string())
    })
}

/// Pipeline stage 2: verified claims, no storage round-trip yet.
pub struct AuthClaims(pub Claims);

#[async_trait]
impl<S> FromRequestParts<S> for AuthClaims
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let config = parts
            .extensions
            .get::<Arc<Config>>()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("config extension missing")))?;
        let token = bearer_or_cookie(parts).ok_or(AppError::Unauthenticated)?;
        let claims = decode_access_token(&config.auth.jwt, &token)?;
        Ok(AuthClaims(claims))
    }
}

/// Pipeline stage 3: the authenticated actor. The user row must exist, be
/// enabled, and belong to the workspace the token was minted for.
pub struct Actor {
    pub user: User,
    pub workspace_id: Uuid,
    pub role: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthClaims(claims) = AuthClaims::from_request_parts(parts, state).await?;
        let pool = parts
            .extensions
            .get::<PgPool>()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("pool extension missing")))?
            .clone();
        let user = tenancy::find_user(&pool, claims.sub)
            .await?
            .ok_or(AppError::Unauthenticated)?;
        if !user.enabled || user.workspace_id != claims.workspace_id {
            return Err(AppError::Unauthenticated);
        }
        let workspace_id = user.workspace_id;
        let role = user.role.clone();
        Ok(Actor {
            user,
            workspace_id,
            role,
        })
    }
}

#[derive(Deserialize)]
struct BusinessPathParams {
    business_descriptor: String,
}

/// Pipeline stage 4: actor plus the business resolved from the URL
/// descriptor within the actor's workspace. A miss is 404, never 403.
pub struct ActorBusiness {
    pub actor: Actor,
    pub business: Business,
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorBusiness
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let actor = Actor::from_request_parts(parts, state).await?;
        let Path(params) = Path::<BusinessPathParams>::from_request_parts(parts, state)
            .await
            .map_err(|_| AppError::not_found("tenant.not_found"))?;
        let pool = parts
            .extensions
            .get::<PgPool>()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("pool extension missing")))?
            .clone();
        let business = tenancy::find_business_by_descriptor(
            &pool,
            actor.workspace_id,
            &params.business_descriptor,
        )
        .await?;
        Ok(ActorBusiness { actor, business })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret".into(),
            expiry_seconds: 3600,
            issuer: "kyora".into(),
            audience: "kyora-api".into(),
        }
    }

    #[test]
    fn token_round_trips() {
        let cfg = jwt_config();
        let user = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        let token = issue_access_token(&cfg, user, workspace).unwrap();
        let claims = decode_access_token(&cfg, &token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.workspace_id, workspace);
        assert_eq!(claims.iss, "kyora");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let cfg = jwt_config();
        let token = issue_access_token(&cfg, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let mut other = jwt_config();
        other.secret = "different".into();
        assert!(decode_access_token(&other, &token).is_err());
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let cfg = jwt_config();
        let token = issue_access_token(&cfg, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let mut other = jwt_config();
        other.audience = "other-api".into();
        assert!(decode_access_token(&other, &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut cfg = jwt_config();
        cfg.expiry_seconds = -120;
        let token = issue_access_token(&cfg, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        assert!(decode_access_token(&cfg, &token).is_err());
    }
}
