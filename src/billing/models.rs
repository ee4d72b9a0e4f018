use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-models -> plans,subscriptions,webhook dedupe

pub const STATUS_TRIALING: &str = "trialing";
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_PAST_DUE: &str = "past_due";
pub const STATUS_CANCELED: &str = "canceled";
pub const STATUS_INCOMPLETE: &str = "incomplete";

/// Feature bits carried by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Feature {
    RecurringExpenses = 1 << 0,
    TransactionFeeAutomation = 1 << 1,
    AdvancedReports = 1 << 2,
    Storefront = 1 << 3,
}

impl Feature {
    pub fn name(self) -> &'static str {
        match self {
            Feature::RecurringExpenses => "recurringExpenses",
            Feature::TransactionFeeAutomation => "transactionFeeAutomation",
            Feature::AdvancedReports => "advancedReports",
            Feature::Storefront => "storefront",
        }
    }
}

/// Numeric caps carried by a plan; negative means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitField {
    MaxTeamMembers,
    MaxBusinesses,
    MaxOrdersPerMonth,
}

impl LimitField {
    pub fn name(self) -> &'static str {
        match self {
            LimitField::MaxTeamMembers => "maxTeamMembers",
            LimitField::MaxBusinesses => "maxBusinesses",
            LimitField::MaxOrdersPerMonth => "maxOrdersPerMonth",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub currency: String,
    pub amount_cents: i32,
    pub billing_period: String,
    pub features: i64,
    pub max_team_members: i64,
    pub max_businesses: i64,
    pub max_orders_per_month: i64,
    pub provider_price_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn is_paid(&self) -> bool {
        self.amount_cents > 0
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features & (feature as i64) != 0
    }

    pub fn limit(&self, field: LimitField) -> i64 {
        match field {
            LimitField::MaxTeamMembers => self.max_team_members,
            LimitField::MaxBusinesses => self.max_businesses,
            LimitField::MaxOrdersPerMonth => self.max_orders_per_month,
        }
    }
}

/// Mirror of the provider's subscription; never authoritative locally.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub scheduled_plan_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether the workspace may use gated features right now. `past_due`
    /// keeps working inside the grace window measured from the last status
    /// change.
    pub fn in_good_standing(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.status.as_str() {
            STATUS_ACTIVE | STATUS_TRIALING => true,
            STATUS_PAST_DUE => self.updated_at + grace > now,
            _ => false,
        }
    }
}

/// Dedupe ledger row for provider webhook events.
#[derive(Debug, Clone, FromRow)]
pub struct WebhookEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}
