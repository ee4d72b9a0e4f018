use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::events::Event;

use super::models::{
    Feature, Plan, Subscription, STATUS_ACTIVE, STATUS_CANCELED, STATUS_INCOMPLETE,
    STATUS_PAST_DUE, STATUS_TRIALING,
};
use super::stripe::StripeClient;

/// key: billing-service -> subscription mirror and plan catalog
#[derive(Clone)]
pub struct BillingService {
    pool: PgPool,
}

/// Plan definitions owned by the code; `sync-plans` reconciles them into the
/// local store and the provider.
pub struct PlanDefinition {
    pub code: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub amount_cents: i32,
    pub features: i64,
    pub max_team_members: i64,
    pub max_businesses: i64,
    pub max_orders_per_month: i64,
}

pub const DEFAULT_PLANS: &[PlanDefinition] = &[
    PlanDefinition {
        code: "free",
        name: "Free",
        description: "Run one business through your DMs",
        amount_cents: 0,
        features: 0,
        max_team_members: 1,
        max_businesses: 1,
        max_orders_per_month: 50,
    },
    PlanDefinition {
        code: "starter",
        name: "Starter",
        description: "Automation for a growing shop",
        amount_cents: 900,
        features: Feature::RecurringExpenses as i64 | Feature::TransactionFeeAutomation as i64,
        max_team_members: 3,
        max_businesses: 1,
        max_orders_per_month: 500,
    },
    PlanDefinition {
        code: "growth",
        name: "Growth",
        description: "Several businesses, a real team",
        amount_cents: 2900,
        features: Feature::RecurringExpenses as i64
            | Feature::TransactionFeeAutomation as i64
            | Feature::AdvancedReports as i64
            | Feature::Storefront as i64,
        max_team_members: 10,
        max_businesses: 3,
        max_orders_per_month: -1,
    },
];

impl BillingService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_plans(&self) -> AppResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE active = TRUE ORDER BY amount_cents ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(plans)
    }

    pub async fn plan_by_code(&self, code: &str) -> AppResult<Plan> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE code = $1 AND active = TRUE")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::from)?
            .ok_or(AppError::not_found("billing.plan_not_found"))
    }

    pub async fn current_subscription(
        &self,
        workspace_id: Uuid,
    ) -> AppResult<Option<(Subscription, Plan)>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE workspace_id = $1 ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        let Some(subscription) = subscription else {
            return Ok(None);
        };
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(subscription.plan_id)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(Some((subscription, plan)))
    }

    /// Upsert the code-owned plan definitions into the store and make sure
    /// every paid plan has a provider price. Safe to re-run.
    pub async fn sync_plans(&self, stripe: &StripeClient) -> AppResult<usize> {
        let mut synced = 0usize;
        for def in DEFAULT_PLANS {
            let plan = sqlx::query_as::<_, Plan>(
                "INSERT INTO plans \
                 (id, code, name, description, currency, amount_cents, billing_period, features, \
                  max_team_members, max_businesses, max_orders_per_month, active) \
                 VALUES ($1, $2, $3, $4, 'USD', $5, 'monthly', $6, $7, $8, $9, TRUE) \
                 ON CONFLICT (code) DO UPDATE SET \
                   name = EXCLUDED.name, \
                   description = EXCLUDED.description, \
                   amount_cents = EXCLUDED.amount_cents, \
                   features = EXCLUDED.features, \
                   max_team_members = EXCLUDED.max_team_members, \
                   max_businesses = EXCLUDED.max_businesses, \
                   max_orders_per_month = EXCLUDED.max_orders_per_month, \
                   updated_at = NOW() \
                 RETURNING *",
            )
            .bind(Uuid::new_v4())
            .bind(def.code)
            .bind(def.name)
            .bind(def.description)
            .bind(def.amount_cents)
            .bind(def.features)
            .bind(def.max_team_members)
            .bind(def.max_businesses)
            .bind(def.max_orders_per_month)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?;

            if plan.is_paid() && plan.provider_price_id.is_none() && stripe.is_configured() {
                let price_id = stripe.create_plan_price(&plan).await?;
                sqlx::query("UPDATE plans SET provider_price_id = $2, updated_at = NOW() WHERE id = $1")
                    .bind(plan.id)
                    .bind(&price_id)
                    .execute(&self.pool)
                    .await
                    .map_err(AppError::from)?;
            }
            synced += 1;
        }
        Ok(synced)
    }

    /// Apply one verified provider event. The dedupe insert makes replays a
    /// no-op; the returned events are for the bus, published by the caller.
    pub async fn apply_webhook(
        &self,
        event_id: &str,
        event_type: &str,
        object: &Value,
    ) -> AppResult<Vec<Event>> {
        let fresh = sqlx::query(
            "INSERT INTO billing_webhook_events (provider_event_id, event_type) \
             VALUES ($1, $2) ON CONFLICT (provider_event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        if fresh.rows_affected() == 0 {
            tracing::debug!(%event_id, "webhook event already processed");
            return Ok(Vec::new());
        }

        let mut to_publish = Vec::new();
        match event_type {
            "customer.subscription.created" | "customer.subscription.updated" => {
                if let Some(changed) = self.sync_subscription_object(object).await? {
                    to_publish.push(changed);
                }
            }
            "customer.subscription.deleted" => {
                if let Some(changed) = self
                    .update_by_provider_id(object, STATUS_CANCELED, None, None)
                    .await?
                {
                    to_publish.push(changed);
                }
            }
            "invoice.payment_succeeded" => {
                let provider_sub = object["subscription"].as_str().map(|s| s.to_string());
                if let Some(provider_sub) = provider_sub {
                    let period = period_bounds(&object["lines"]["data"][0]["period"]);
                    if let Some(changed) = self
                        .update_subscription_status(&provider_sub, STATUS_ACTIVE, period.0, period.1)
                        .await?
                    {
                        to_publish.push(changed);
                    }
                }
            }
            "invoice.payment_failed" => {
                let provider_sub = object["subscription"].as_str().map(|s| s.to_string());
                if let Some(provider_sub) = provider_sub {
                    if let Some(changed) = self
                        .update_subscription_status(&provider_sub, STATUS_PAST_DUE, None, None)
                        .await?
                    {
                        to_publish.push(changed);
                    }
                }
            }
            "checkout.session.completed" => {
                let token = object["metadata"]["onboarding_token"].as_str();
                let provider_sub = object["subscription"].as_str().unwrap_or_default();
                if let Some(token) = token {
                    to_publish.push(Event::OnboardingPaymentSucceeded {
                        session_token: token.to_string(),
                        provider_subscription_id: provider_sub.to_string(),
                    });
                }
            }
            other => {
                // Unknown types are acknowledged and ignored.
                tracing::debug!(event_type = other, "ignoring provider event");
            }
        }
        Ok(to_publish)
    }

    async fn sync_subscription_object(&self, object: &Value) -> AppResult<Option<Event>> {
        let provider_sub = object["id"].as_str().unwrap_or_default().to_string();
        if provider_sub.is_empty() {
            return Ok(None);
        }
        let status = map_provider_status(object["status"].as_str().unwrap_or_default());
        let period_start = epoch_to_datetime(object["current_period_start"].as_i64());
        let period_end = epoch_to_datetime(object["current_period_end"].as_i64());
        let cancel_at_period_end = object["cancel_at_period_end"].as_bool().unwrap_or(false);

        let row = sqlx::query_as::<_, Subscription>(
            "UPDATE subscriptions SET \
               status = $2, \
               current_period_start = COALESCE($3, current_period_start), \
               current_period_end = COALESCE($4, current_period_end), \
               cancel_at_period_end = $5, \
               provider_customer_id = COALESCE($6, provider_customer_id), \
               updated_at = NOW() \
             WHERE provider_subscription_id = $1 RETURNING *",
        )
        .bind(&provider_sub)
        .bind(status)
        .bind(period_start)
        .bind(period_end)
        .bind(cancel_at_period_end)
        .bind(object["customer"].as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(row.map(|subscription| Event::SubscriptionStatusChanged {
            workspace_id: subscription.workspace_id,
            status: subscription.status,
        }))
    }

    async fn update_by_provider_id(
        &self,
        object: &Value,
        status: &str,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
    ) -> AppResult<Option<Event>> {
        let provider_sub = object["id"].as_str().unwrap_or_default().to_string();
        if provider_sub.is_empty() {
            return Ok(None);
        }
        self.update_subscription_status(&provider_sub, status, period_start, period_end)
            .await
    }

    async fn update_subscription_status(
        &self,
        provider_subscription_id: &str,
        status: &str,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
    ) -> AppResult<Option<Event>> {
        let row = sqlx::query_as::<_, Subscription>(
            "UPDATE subscriptions SET \
               status = $2, \
               current_period_start = COALESCE($3, current_period_start), \
               current_period_end = COALESCE($4, current_period_end), \
               updated_at = NOW() \
             WHERE provider_subscription_id = $1 RETURNING *",
        )
        .bind(provider_subscription_id)
        .bind(status)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        if row.is_none() {
            tracing::warn!(
                %provider_subscription_id,
                "webhook referenced unknown subscription"
            );
        }
        Ok(row.map(|subscription| Event::SubscriptionStatusChanged {
            workspace_id: subscription.workspace_id,
            status: subscription.status,
        }))
    }

    /// Immediate changes swap the provider price with prorations; scheduled
    /// ones record the intent locally and flip at the period boundary.
    pub async fn change_plan(
        &self,
        stripe: &StripeClient,
        workspace_id: Uuid,
        new_plan_code: &str,
        immediate: bool,
    ) -> AppResult<Subscription> {
        let (subscription, current_plan) = self
            .current_subscription(workspace_id)
            .await?
            .ok_or(AppError::not_found("billing.subscription_not_found"))?;
        let new_plan = self.plan_by_code(new_plan_code).await?;
        if new_plan.id == current_plan.id {
            return Err(AppError::conflict(
                "billing.plan_unchanged",
                "the workspace is already on this plan",
            ));
        }

        if let (Some(provider_sub), Some(price_id)) = (
            subscription.provider_subscription_id.as_deref(),
            new_plan.provider_price_id.as_deref(),
        ) {
            let item_id = stripe.subscription_item_id(provider_sub).await?;
            stripe
                .update_subscription_price(provider_sub, &item_id, price_id, immediate)
                .await?;
        }

        let row = if immediate {
            sqlx::query_as::<_, Subscription>(
                "UPDATE subscriptions SET plan_id = $2, scheduled_plan_id = NULL, updated_at = NOW() \
                 WHERE id = $1 RETURNING *",
            )
            .bind(subscription.id)
            .bind(new_plan.id)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?
        } else {
            sqlx::query_as::<_, Subscription>(
                "UPDATE subscriptions SET scheduled_plan_id = $2, updated_at = NOW() \
                 WHERE id = $1 RETURNING *",
            )
            .bind(subscription.id)
            .bind(new_plan.id)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?
        };
        Ok(row)
    }
}

fn epoch_to_datetime(epoch: Option<i64>) -> Option<DateTime<Utc>> {
    epoch.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn period_bounds(period: &Value) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    (
        epoch_to_datetime(period["start"].as_i64()),
        epoch_to_datetime(period["end"].as_i64()),
    )
}

/// The local state machine mirrors the provider's vocabulary.
pub fn map_provider_status(provider_status: &str) -> &'static str {
    match provider_status {
        "trialing" => STATUS_TRIALING,
        "active" => STATUS_ACTIVE,
        "past_due" | "unpaid" => STATUS_PAST_DUE,
        "canceled" | "incomplete_expired" => STATUS_CANCELED,
        _ => STATUS_INCOMPLETE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_statuses_map_onto_the_local_machine() {
        assert_eq!(map_provider_status("active"), STATUS_ACTIVE);
        assert_eq!(map_provider_status("trialing"), STATUS_TRIALING);
        assert_eq!(map_provider_status("unpaid"), STATUS_PAST_DUE);
        assert_eq!(map_provider_status("incomplete_expired"), STATUS_CANCELED);
        assert_eq!(map_provider_status("incomplete"), STATUS_INCOMPLETE);
        assert_eq!(map_provider_status("something_new"), STATUS_INCOMPLETE);
    }

    #[test]
    fn epoch_conversion_tolerates_missing_values() {
        assert!(epoch_to_datetime(None).is_none());
        let dt = epoch_to_datetime(Some(1_700_000_000)).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn default_plans_include_a_free_tier() {
        assert!(DEFAULT_PLANS.iter().any(|p| p.amount_cents == 0));
        assert!(DEFAULT_PLANS.iter().all(|p| p.max_team_members != 0));
    }
}
