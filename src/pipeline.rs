use std::future::Future;
use std::sync::Arc;

use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::Extension;
use chrono::{Duration, Utc};
use sqlx::PgPool;

use crate::billing::models::{Feature, LimitField, Plan, Subscription};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::extractor::Actor;
use crate::tenancy::{ROLE_ADMIN, ROLE_USER};

/// key: request-pipeline -> rbac matrix and plan gates

/// Pipeline stage 1: reject requests whose declared length exceeds the cap.
/// Streamed bodies without a length are caught by the router's body limit at
/// decode time.
pub async fn body_limit<B>(
    Extension(config): Extension<Arc<Config>>,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, AppError> {
    if let Some(length) = request
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > config.http.max_body_bytes {
            return Err(AppError::PayloadTooLarge);
        }
    }
    Ok(next.run(request).await)
}

const ADMIN_GRANTS: &[(&str, &str)] = &[("manage", "*")];
const USER_GRANTS: &[(&str, &str)] = &[
    ("manage", "orders"),
    ("manage", "inventory"),
    ("manage", "customers"),
    ("manage", "accounting"),
    ("view", "team"),
    ("view", "billing"),
    ("view", "businesses"),
];

fn grants_for(role: &str) -> &'static [(&'static str, &'static str)] {
    match role {
        ROLE_ADMIN => ADMIN_GRANTS,
        ROLE_USER => USER_GRANTS,
        _ => &[],
    }
}

fn permitted(role: &str, action: &str, resource: &str) -> bool {
    let grants = grants_for(role);
    let direct = grants
        .iter()
        .any(|(a, r)| *a == action && (*r == resource || *r == "*"));
    if direct {
        return true;
    }
    // manage:X implies view:X
    action == "view"
        && grants
            .iter()
            .any(|(a, r)| *a == "manage" && (*r == resource || *r == "*"))
}

/// Pipeline stage 5a: role-based access.
pub fn requires(actor: &Actor, action: &str, resource: &str) -> AppResult<()> {
    if permitted(&actor.role, action, resource) {
        return Ok(());
    }
    Err(AppError::Forbidden)
}

/// The workspace's subscription and plan, loaded once per guarded request.
pub struct SubscriptionGate {
    pub subscription: Subscription,
    pub plan: Plan,
}

/// Pipeline stage 5b: the workspace must hold a usable subscription
/// (active, trialing, or past_due within the grace window).
pub async fn requires_active_subscription(
    pool: &PgPool,
    config: &Config,
    workspace_id: uuid::Uuid,
) -> AppResult<SubscriptionGate> {
    let row = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE workspace_id = $1 ORDER BY updated_at DESC LIMIT 1",
    )
    .bind(workspace_id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?;
    let subscription = row.ok_or(AppError::Forbidden)?;

    let grace = Duration::days(config.billing.past_due_grace_days);
    if !subscription.in_good_standing(Utc::now(), grace) {
        return Err(AppError::Forbidden);
    }

    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
        .bind(subscription.plan_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::from)?;

    Ok(SubscriptionGate { subscription, plan })
}

/// Pipeline stage 5c: feature bit gate.
pub fn requires_plan_feature(gate: &SubscriptionGate, feature: Feature) -> AppResult<()> {
    if gate.plan.has_feature(feature) {
        return Ok(());
    }
    Err(AppError::Forbidden)
}

/// Numeric-limit comparison; negative limit means unlimited. The request is
/// refused when it would push usage beyond the cap.
pub fn check_plan_limit(plan: &Plan, field: LimitField, observed: i64) -> AppResult<()> {
    let limit = plan.limit(field);
    if limit >= 0 && observed >= limit {
        return Err(AppError::PlanLimitExceeded {
            feature: field.name(),
            limit,
            observed,
        });
    }
    Ok(())
}

/// Pipeline stage 5d: limit gate fed by the owning domain's live counter.
pub async fn requires_plan_limit<F>(
    gate: &SubscriptionGate,
    field: LimitField,
    usage: F,
) -> AppResult<()>
where
    F: Future<Output = AppResult<i64>>,
{
    let observed = usage.await?;
    check_plan_limit(&gate.plan, field, observed)
}
