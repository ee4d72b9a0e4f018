use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// key: onboarding-session -> staged signup state machine

pub const PAYMENT_NONE: &str = "none";
pub const PAYMENT_PENDING: &str = "pending";
pub const PAYMENT_SUCCEEDED: &str = "succeeded";
pub const PAYMENT_FAILED: &str = "failed";
pub const PAYMENT_SKIPPED: &str = "skipped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PlanSelected,
    IdentityPending,
    IdentityVerified,
    BusinessStaged,
    PaymentPending,
    PaymentConfirmed,
    ReadyToCommit,
    Committed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PlanSelected => "plan_selected",
            Stage::IdentityPending => "identity_pending",
            Stage::IdentityVerified => "identity_verified",
            Stage::BusinessStaged => "business_staged",
            Stage::PaymentPending => "payment_pending",
            Stage::PaymentConfirmed => "payment_confirmed",
            Stage::ReadyToCommit => "ready_to_commit",
            Stage::Committed => "committed",
        }
    }

    pub fn parse(raw: &str) -> Option<Stage> {
        Some(match raw {
            "plan_selected" => Stage::PlanSelected,
            "identity_pending" => Stage::IdentityPending,
            "identity_verified" => Stage::IdentityVerified,
            "business_staged" => Stage::BusinessStaged,
            "payment_pending" => Stage::PaymentPending,
            "payment_confirmed" => Stage::PaymentConfirmed,
            "ready_to_commit" => Stage::ReadyToCommit,
            "committed" => Stage::Committed,
            _ => return None,
        })
    }

    /// The ordered transition table. The free-plan path skips the payment
    /// stages; a paid plan must pass through them.
    pub fn can_transition(self, to: Stage, paid_plan: bool) -> bool {
        use Stage::*;
        matches!(
            (self, to, paid_plan),
            (PlanSelected, IdentityPending, _)
                | (IdentityPending, IdentityVerified, _)
                | (IdentityVerified, BusinessStaged, _)
                | (BusinessStaged, PaymentPending, true)
                | (BusinessStaged, ReadyToCommit, false)
                | (PaymentPending, PaymentConfirmed, true)
                | (PaymentConfirmed, ReadyToCommit, true)
                | (ReadyToCommit, Committed, _)
        )
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OnboardingSession {
    pub id: Uuid,
    pub token: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub pending_full_name: Option<String>,
    pub pending_password_hash: Option<String>,
    pub identity_provider: Option<String>,
    pub otp_hash: Option<String>,
    pub business_name: Option<String>,
    pub business_descriptor: Option<String>,
    pub business_country: Option<String>,
    pub business_currency: Option<String>,
    pub plan_id: Option<Uuid>,
    pub plan_code: Option<String>,
    pub paid_plan: bool,
    pub provider_checkout_id: Option<String>,
    pub provider_checkout_url: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub payment_status: String,
    pub stage: String,
    pub expires_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingSession {
    pub fn stage(&self) -> Stage {
        Stage::parse(&self.stage).unwrap_or(Stage::PlanSelected)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Client-facing projection; secrets stay server-side.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub token: String,
    pub stage: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub business_name: Option<String>,
    pub business_descriptor: Option<String>,
    pub business_country: Option<String>,
    pub business_currency: Option<String>,
    pub plan_code: Option<String>,
    pub paid_plan: bool,
    pub payment_status: String,
    pub checkout_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl From<&OnboardingSession> for SessionView {
    fn from(session: &OnboardingSession) -> Self {
        SessionView {
            token: session.token.clone(),
            stage: session.stage.clone(),
            email: session.email.clone(),
            email_verified: session.email_verified,
            business_name: session.business_name.clone(),
            business_descriptor: session.business_descriptor.clone(),
            business_country: session.business_country.clone(),
            business_currency: session.business_currency.clone(),
            plan_code: session.plan_code.clone(),
            paid_plan: session.paid_plan,
            payment_status: session.payment_status.clone(),
            checkout_url: session.provider_checkout_url.clone(),
            expires_at: session.expires_at,
        }
    }
}
