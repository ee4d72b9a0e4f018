use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, patch};
use axum::{Json, Router};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::billing::models::Feature;
use crate::config::Config;
use crate::error::AppResult;
use crate::extractor::ActorBusiness;
use crate::pipeline;
use crate::store::{PageEnvelope, PageRequest, Repository, Scope};

use super::models::{
    Expense, Investment, RecurringExpense, Withdrawal, EXPENSE_SCHEMA, INVESTMENT_SCHEMA,
    RECURRING_EXPENSE_SCHEMA, WITHDRAWAL_SCHEMA,
};
use super::service::{AccountingService, CreateRecurringInput};
use super::summary::{self, SummaryBundle};

/// key: accounting-api -> business-scoped accounting endpoints

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/businesses/:business_descriptor/recurring-expenses",
            get(list_recurring).post(create_recurring),
        )
        .route(
            "/v1/businesses/:business_descriptor/recurring-expenses/:id",
            get(get_recurring).delete(delete_recurring),
        )
        .route(
            "/v1/businesses/:business_descriptor/recurring-expenses/:id/status",
            patch(update_recurring_status),
        )
        .route(
            "/v1/businesses/:business_descriptor/expenses",
            get(list_expenses).post(create_expense),
        )
        .route(
            "/v1/businesses/:business_descriptor/withdrawals",
            get(list_withdrawals).post(create_withdrawal),
        )
        .route(
            "/v1/businesses/:business_descriptor/investments",
            get(list_investments).post(create_investment),
        )
        .route(
            "/v1/businesses/:business_descriptor/accounting/summary",
            get(get_summary),
        )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecurringRequest {
    pub amount: Decimal,
    pub currency: Option<String>,
    pub category: String,
    pub frequency: String,
    pub recurring_start_date: NaiveDate,
    pub recurring_end_date: Option<NaiveDate>,
    pub note: Option<String>,
    #[serde(default)]
    pub auto_create_historical_expenses: bool,
}

async fn create_recurring(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    scoped: ActorBusiness,
    Json(payload): Json<CreateRecurringRequest>,
) -> AppResult<(StatusCode, Json<RecurringExpense>)> {
    pipeline::requires(&scoped.actor, "manage", "accounting")?;
    let gate =
        pipeline::requires_active_subscription(&pool, &config, scoped.actor.workspace_id).await?;
    pipeline::requires_plan_feature(&gate, Feature::RecurringExpenses)?;

    let service = AccountingService::new(pool);
    let template = service
        .create_recurring(
            &scoped.business,
            CreateRecurringInput {
                amount: payload.amount,
                currency: payload.currency,
                category: payload.category,
                frequency: payload.frequency,
                recurring_start_date: payload.recurring_start_date,
                recurring_end_date: payload.recurring_end_date,
                note: payload.note,
                auto_create_historical_expenses: payload.auto_create_historical_expenses,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_recurring(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<PageEnvelope<RecurringExpense>>> {
    pipeline::requires(&scoped.actor, "view", "accounting")?;
    let repo = Repository::<RecurringExpense>::new(pool, &RECURRING_EXPENSE_SCHEMA);
    let envelope = repo
        .list(&[Scope::Business(scoped.business.id)], &[], &page)
        .await?;
    Ok(Json(envelope))
}

async fn get_recurring(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Path((_, id)): Path<(String, Uuid)>,
) -> AppResult<Json<RecurringExpense>> {
    pipeline::requires(&scoped.actor, "view", "accounting")?;
    let repo = Repository::<RecurringExpense>::new(pool, &RECURRING_EXPENSE_SCHEMA);
    let template = repo
        .find_by_id(id, &[Scope::Business(scoped.business.id)])
        .await?;
    Ok(Json(template))
}

async fn delete_recurring(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Path((_, id)): Path<(String, Uuid)>,
) -> AppResult<StatusCode> {
    pipeline::requires(&scoped.actor, "manage", "accounting")?;
    let service = AccountingService::new(pool);
    service.delete_recurring(scoped.business.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

async fn update_recurring_status(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Path((_, id)): Path<(String, Uuid)>,
    Json(payload): Json<UpdateStatusRequest>,
) -> AppResult<Json<RecurringExpense>> {
    pipeline::requires(&scoped.actor, "manage", "accounting")?;
    let service = AccountingService::new(pool);
    let template = service
        .update_status(scoped.business.id, id, &payload.status)
        .await?;
    Ok(Json(template))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExpenseRequest {
    pub amount: Decimal,
    pub occurred_on: NaiveDate,
    pub category: String,
    pub note: Option<String>,
}

async fn create_expense(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Json(payload): Json<CreateExpenseRequest>,
) -> AppResult<(StatusCode, Json<Expense>)> {
    pipeline::requires(&scoped.actor, "manage", "accounting")?;
    let service = AccountingService::new(pool);
    let expense = service
        .create_expense(
            &scoped.business,
            payload.amount,
            payload.occurred_on,
            &payload.category,
            payload.note,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(expense)))
}

async fn list_expenses(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<PageEnvelope<Expense>>> {
    pipeline::requires(&scoped.actor, "view", "accounting")?;
    let repo = Repository::<Expense>::new(pool, &EXPENSE_SCHEMA);
    let envelope = repo
        .list(&[Scope::Business(scoped.business.id)], &[], &page)
        .await?;
    Ok(Json(envelope))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCashflowRequest {
    pub amount: Decimal,
    pub occurred_on: NaiveDate,
    pub note: Option<String>,
}

async fn create_withdrawal(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Json(payload): Json<CreateCashflowRequest>,
) -> AppResult<(StatusCode, Json<Withdrawal>)> {
    pipeline::requires(&scoped.actor, "manage", "accounting")?;
    let service = AccountingService::new(pool);
    let withdrawal = service
        .create_withdrawal(
            &scoped.business,
            payload.amount,
            payload.occurred_on,
            payload.note,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(withdrawal)))
}

async fn list_withdrawals(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<PageEnvelope<Withdrawal>>> {
    pipeline::requires(&scoped.actor, "view", "accounting")?;
    let repo = Repository::<Withdrawal>::new(pool, &WITHDRAWAL_SCHEMA);
    let envelope = repo
        .list(&[Scope::Business(scoped.business.id)], &[], &page)
        .await?;
    Ok(Json(envelope))
}

async fn create_investment(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Json(payload): Json<CreateCashflowRequest>,
) -> AppResult<(StatusCode, Json<Investment>)> {
    pipeline::requires(&scoped.actor, "manage", "accounting")?;
    let service = AccountingService::new(pool);
    let investment = service
        .create_investment(
            &scoped.business,
            payload.amount,
            payload.occurred_on,
            payload.note,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(investment)))
}

async fn list_investments(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<PageEnvelope<Investment>>> {
    pipeline::requires(&scoped.actor, "view", "accounting")?;
    let repo = Repository::<Investment>::new(pool, &INVESTMENT_SCHEMA);
    let envelope = repo
        .list(&[Scope::Business(scoped.business.id)], &[], &page)
        .await?;
    Ok(Json(envelope))
}

#[derive(Deserialize)]
pub struct SummaryQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

async fn get_summary(
    Extension(pool): Extension<PgPool>,
    scoped: ActorBusiness,
    Query(query): Query<SummaryQuery>,
) -> AppResult<Json<SummaryBundle>> {
    pipeline::requires(&scoped.actor, "view", "accounting")?;
    let from = query
        .from
        .as_deref()
        .map(summary::parse_summary_date)
        .transpose()?;
    let to = query
        .to
        .as_deref()
        .map(summary::parse_summary_date)
        .transpose()?;
    let bundle = summary::compute_summary(&pool, &scoped.business, from, to).await?;
    Ok(Json(bundle))
}
