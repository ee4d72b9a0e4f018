use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::StripeConfig;
use crate::error::{AppError, AppResult};

use super::models::Plan;

const STRIPE_BASE: &str = "https://api.stripe.com";

/// key: stripe-client -> thin form-encoded wrapper over the provider API
pub struct StripeClient {
    client: Client,
    base: String,
    api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProrationPreview {
    pub amount_due: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedObject {
    id: String,
}

impl StripeClient {
    pub fn new(cfg: &StripeConfig) -> Self {
        Self::with_base(cfg, STRIPE_BASE)
    }

    pub fn with_base(cfg: &StripeConfig, base: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("client build"),
            base: base.into().trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> AppResult<serde_json::Value> {
        let url = format!("{}/v1/{path}", self.base);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(form)
            .send()
            .await
            .map_err(|err| AppError::external("provider.stripe", err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::external(
                "provider.stripe",
                format!("{path} returned {status}: {body}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| AppError::external("provider.stripe", err.to_string()))
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> AppResult<serde_json::Value> {
        let url = format!("{}/v1/{path}", self.base);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.api_key, Option::<&str>::None)
            .query(query)
            .send()
            .await
            .map_err(|err| AppError::external("provider.stripe", err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::external(
                "provider.stripe",
                format!("{path} returned {status}: {body}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| AppError::external("provider.stripe", err.to_string()))
    }

    /// Create the provider-side product and recurring price for a plan.
    /// Returns the price id to persist on the local plan row.
    pub async fn create_plan_price(&self, plan: &Plan) -> AppResult<String> {
        let product: CreatedObject = serde_json::from_value(
            self.post_form(
                "products",
                &[
                    ("name", plan.name.clone()),
                    ("metadata[plan_code]", plan.code.clone()),
                ],
            )
            .await?,
        )
        .map_err(|err| AppError::external("provider.stripe", err.to_string()))?;

        let price: CreatedObject = serde_json::from_value(
            self.post_form(
                "prices",
                &[
                    ("product", product.id),
                    ("unit_amount", plan.amount_cents.to_string()),
                    ("currency", plan.currency.to_lowercase()),
                    ("recurring[interval]", interval_for(&plan.billing_period)),
                ],
            )
            .await?,
        )
        .map_err(|err| AppError::external("provider.stripe", err.to_string()))?;

        Ok(price.id)
    }

    /// Checkout session for an onboarding signup; the session token rides in
    /// metadata so the webhook can route the completion back.
    pub async fn create_checkout_session(
        &self,
        price_id: &str,
        onboarding_token: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> AppResult<CheckoutSession> {
        let value = self
            .post_form(
                "checkout/sessions",
                &[
                    ("mode", "subscription".to_string()),
                    ("line_items[0][price]", price_id.to_string()),
                    ("line_items[0][quantity]", "1".to_string()),
                    ("success_url", success_url.to_string()),
                    ("cancel_url", cancel_url.to_string()),
                    (
                        "metadata[onboarding_token]",
                        onboarding_token.to_string(),
                    ),
                    (
                        "subscription_data[metadata][onboarding_token]",
                        onboarding_token.to_string(),
                    ),
                ],
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| AppError::external("provider.stripe", err.to_string()))
    }

    /// Upcoming-invoice preview for a plan change; the provider computes the
    /// proration, we only expose it read-only.
    pub async fn preview_proration(
        &self,
        customer_id: &str,
        subscription_id: &str,
        new_price_id: &str,
    ) -> AppResult<ProrationPreview> {
        let value = self
            .get(
                "invoices/upcoming",
                &[
                    ("customer", customer_id.to_string()),
                    ("subscription", subscription_id.to_string()),
                    (
                        "subscription_details[items][0][price]",
                        new_price_id.to_string(),
                    ),
                    (
                        "subscription_details[proration_behavior]",
                        "create_prorations".to_string(),
                    ),
                ],
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| AppError::external("provider.stripe", err.to_string()))
    }

    /// Apply a plan change. Immediate changes let the provider prorate;
    /// scheduled ones flip at the period boundary.
    pub async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        new_price_id: &str,
        immediate: bool,
    ) -> AppResult<()> {
        let proration = if immediate {
            "create_prorations"
        } else {
            "none"
        };
        self.post_form(
            &format!("subscriptions/{subscription_id}"),
            &[
                ("items[0][id]", item_id.to_string()),
                ("items[0][price]", new_price_id.to_string()),
                ("proration_behavior", proration.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// First item id of a provider subscription, needed for price swaps.
    pub async fn subscription_item_id(&self, subscription_id: &str) -> AppResult<String> {
        let value = self
            .get(&format!("subscriptions/{subscription_id}"), &[])
            .await?;
        value["items"]["data"][0]["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AppError::external("provider.stripe", "subscription has no items".to_string())
            })
    }
}

fn interval_for(billing_period: &str) -> String {
    match billing_period {
        "yearly" | "annual" => "year",
        "weekly" => "week",
        "daily" => "day",
        _ => "month",
    }
    .to_string()
}
