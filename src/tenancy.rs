use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::EntitySchema;

/// key: tenancy-models -> workspace,business,user

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub email: String,
    pub full_name: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub role: String,
    pub enabled: bool,
    pub email_verified: bool,
    pub identity_provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sub-tenant under a workspace. Addressed in URLs by `descriptor`, which is
/// globally unique (it names the public storefront URL), so it is also
/// unique within its workspace.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Business {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub descriptor: String,
    pub name: String,
    pub country: String,
    pub currency: String,
    pub safety_buffer: Decimal,
    pub fee_percent: Decimal,
    pub fee_fixed: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub static BUSINESS_SCHEMA: EntitySchema = EntitySchema {
    table: "businesses",
    orderable: &["name", "descriptor", "created_at"],
    searchable: &["name", "descriptor"],
    default_order: "created_at ASC",
};

static DESCRIPTOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").expect("valid regex"));

pub fn validate_descriptor(descriptor: &str) -> AppResult<()> {
    if !DESCRIPTOR_RE.is_match(descriptor) {
        return Err(AppError::validation(
            "business.invalid_descriptor",
            "descriptor must be a lowercase slug (letters, digits, hyphens)",
        ));
    }
    Ok(())
}

/// Resolve a business from the URL descriptor inside the caller's workspace.
/// A miss is always `not_found`; the handler cannot tell "other tenant" from
/// "does not exist".
pub async fn find_business_by_descriptor(
    pool: &PgPool,
    workspace_id: Uuid,
    descriptor: &str,
) -> AppResult<Business> {
    let business = sqlx::query_as::<_, Business>(
        "SELECT * FROM businesses WHERE workspace_id = $1 AND descriptor = $2",
    )
    .bind(workspace_id)
    .bind(descriptor)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?;
    business.ok_or(AppError::not_found("tenant.not_found"))
}

pub async fn find_user(pool: &PgPool, user_id: Uuid) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_accepts_slugs() {
        for ok in ["acme", "acme-store", "a1", "shop-42", "a"] {
            assert!(validate_descriptor(ok).is_ok(), "{ok} should be valid");
        }
    }

    #[test]
    fn descriptor_rejects_non_slugs() {
        for bad in ["", "A", "-acme", "acme-", "has space", "emoji🙂"] {
            assert!(validate_descriptor(bad).is_err(), "{bad} should be invalid");
        }
    }
}
