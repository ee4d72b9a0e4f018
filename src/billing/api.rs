use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::extractor::Actor;
use crate::pipeline;

use super::models::{Plan, Subscription};
use super::service::BillingService;
use super::stripe::{ProrationPreview, StripeClient};

/// key: billing-api -> plans, subscription, proration

pub fn routes() -> Router {
    Router::new()
        .route("/v1/billing/plans", get(list_plans))
        .route("/v1/billing/subscription", get(get_subscription))
        .route(
            "/v1/billing/subscription/proration",
            get(preview_proration),
        )
        .route("/v1/billing/subscription/change", post(change_plan))
}

async fn list_plans(Extension(pool): Extension<PgPool>) -> AppResult<Json<Vec<Plan>>> {
    let service = BillingService::new(pool);
    Ok(Json(service.list_plans().await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEnvelope {
    pub subscription: Subscription,
    pub plan: Plan,
}

async fn get_subscription(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
) -> AppResult<Json<Option<SubscriptionEnvelope>>> {
    pipeline::requires(&actor, "view", "billing")?;
    let service = BillingService::new(pool);
    let envelope = service
        .current_subscription(actor.workspace_id)
        .await?
        .map(|(subscription, plan)| SubscriptionEnvelope { subscription, plan });
    Ok(Json(envelope))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProrationQuery {
    pub plan_code: String,
}

async fn preview_proration(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(stripe): Extension<Arc<StripeClient>>,
    actor: Actor,
    Query(query): Query<ProrationQuery>,
) -> AppResult<Json<ProrationPreview>> {
    pipeline::requires(&actor, "view", "billing")?;
    pipeline::requires_active_subscription(&pool, &config, actor.workspace_id).await?;

    let service = BillingService::new(pool);
    let (subscription, _) = service
        .current_subscription(actor.workspace_id)
        .await?
        .ok_or(AppError::not_found("billing.subscription_not_found"))?;
    let new_plan = service.plan_by_code(&query.plan_code).await?;

    let (customer, provider_sub) = match (
        subscription.provider_customer_id.as_deref(),
        subscription.provider_subscription_id.as_deref(),
    ) {
        (Some(customer), Some(sub)) => (customer, sub),
        _ => {
            return Err(AppError::validation(
                "billing.no_provider_subscription",
                "proration preview requires a provider-billed subscription",
            ))
        }
    };
    let price_id = new_plan.provider_price_id.as_deref().ok_or_else(|| {
        AppError::validation(
            "billing.no_provider_price",
            "the target plan has no provider price; run sync-plans",
        )
    })?;

    let preview = stripe
        .preview_proration(customer, provider_sub, price_id)
        .await?;
    Ok(Json(preview))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanRequest {
    pub plan_code: String,
    #[serde(default = "default_immediate")]
    pub immediate: bool,
}

fn default_immediate() -> bool {
    true
}

async fn change_plan(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(stripe): Extension<Arc<StripeClient>>,
    actor: Actor,
    Json(payload): Json<ChangePlanRequest>,
) -> AppResult<Json<Subscription>> {
    pipeline::requires(&actor, "manage", "billing")?;
    pipeline::requires_active_subscription(&pool, &config, actor.workspace_id).await?;
    let service = BillingService::new(pool);
    let subscription = service
        .change_plan(
            &stripe,
            actor.workspace_id,
            &payload.plan_code,
            payload.immediate,
        )
        .await?;
    Ok(Json(subscription))
}
