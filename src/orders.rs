use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::billing::models::LimitField;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::events::{Event, EventBus};
use crate::extractor::ActorBusiness;
use crate::pipeline;
use crate::store::{EntitySchema, PageEnvelope, PageRequest, Repository, Scope};

/// key: orders -> minimal domain exercising scope, gates and the event bus

pub const ORDER_STATUS_PENDING: &str = "pending";
pub const ORDER_STATUS_PAID: &str = "paid";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub business_id: Uuid,
    pub total: Decimal,
    pub cost_of_goods: Decimal,
    pub currency: String,
    pub status: String,
    pub occurred_on: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub static ORDER_SCHEMA: EntitySchema = EntitySchema {
    table: "orders",
    orderable: &["occurred_on", "total", "status", "created_at"],
    searchable: &[],
    default_order: "occurred_on DESC, created_at DESC",
};

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/businesses/:business_descriptor/orders",
            get(list_orders).post(create_order),
        )
        .route(
            "/v1/businesses/:business_descriptor/orders/:id",
            get(get_order),
        )
        .route(
            "/v1/businesses/:business_descriptor/orders/:id/pay",
            post(mark_paid),
        )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub total: Decimal,
    #[serde(default)]
    pub cost_of_goods: Decimal,
    pub occurred_on: NaiveDate,
}

async fn create_order(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    scoped: ActorBusiness,
    Json(payload): Json<CreateOrderRequest>,
) -> AppResult<(StatusCode, Json<Order>)> {
    pipeline::requires(&scoped.actor, "manage", "orders")?;
    if payload.total <= Decimal::ZERO || payload.cost_of_goods < Decimal::ZERO {
        return Err(AppError::validation(
            "order.invalid_amount",
            "order total must be positive and cost of goods non-negative",
        ));
    }

    let gate =
        pipeline::requires_active_subscription(&pool, &config, scoped.actor.workspace_id).await?;
    let business_id = scoped.business.id;
    let pool_for_count = pool.clone();
    pipeline::requires_plan_limit(&gate, LimitField::MaxOrdersPerMonth, async move {
        let now = Utc::now();
        let month_start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
            .expect("first of month is valid");
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE business_id = $1 AND occurred_on >= $2",
        )
        .bind(business_id)
        .bind(month_start)
        .fetch_one(&pool_for_count)
        .await
        .map_err(AppError::from)?;
        Ok(count.0)
    })
    .await?;

    let order = sqlx::query_as::<_, Order>(
        "INSERT INTO orders (id, business_id, total, cost_of_goods, currency, status, occurred_on) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(scoped.business.id)
    .bind(payload.total)
    .bind(payload.cost_of_goods)
    .bind(&scoped.business.currency)
    .bind(ORDER_STATUS_PENDING)
    .bind(payload.occurred_on)
    .fetch_one(&pool)
    .await
    .map_err(AppError::from)?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn list_orders(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<PageEnvelope<Order>>> {
    pipeline::requires(&scoped.actor, "view", "orders")?;
    let repo = Repository::<Order>::new(pool, &ORDER_SCHEMA);
    let envelope = repo
        .list(&[Scope::Business(scoped.business.id)], &[], &page)
        .await?;
    Ok(Json(envelope))
}

async fn get_order(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Path((_, id)): Path<(String, Uuid)>,
) -> AppResult<Json<Order>> {
    pipeline::requires(&scoped.actor, "view", "orders")?;
    let repo = Repository::<Order>::new(pool, &ORDER_SCHEMA);
    let order = repo
        .find_by_id(id, &[Scope::Business(scoped.business.id)])
        .await?;
    Ok(Json(order))
}

/// Marking an order paid is what feeds the accounting automation: the event
/// fans out to the transaction-fee subscriber.
async fn mark_paid(
    Extension(pool): Extension<PgPool>,
    Extension(bus): Extension<EventBus>,
    scoped: ActorBusiness,
    Path((_, id)): Path<(String, Uuid)>,
) -> AppResult<Json<Order>> {
    pipeline::requires(&scoped.actor, "manage", "orders")?;
    let order = sqlx::query_as::<_, Order>(
        "UPDATE orders SET status = $3, updated_at = NOW() \
         WHERE id = $1 AND business_id = $2 AND status = $4 RETURNING *",
    )
    .bind(id)
    .bind(scoped.business.id)
    .bind(ORDER_STATUS_PAID)
    .bind(ORDER_STATUS_PENDING)
    .fetch_optional(&pool)
    .await
    .map_err(AppError::from)?
    .ok_or(AppError::not_found("tenant.not_found"))?;

    bus.publish(Event::OrderPaymentSucceeded {
        business_id: order.business_id,
        order_id: order.id,
        order_total: order.total,
        currency: order.currency.clone(),
        occurred_on: Utc::now().date_naive(),
    })
    .await;

    Ok(Json(order))
}
