use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::billing::models::{Plan, Subscription, STATUS_ACTIVE};
use crate::billing::stripe::StripeClient;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::mailer::Mailer;
use crate::oauth::GoogleOauthClient;
use crate::tenancy::{self, Business, User, Workspace, ROLE_ADMIN};

use super::models::{
    OnboardingSession, Stage, PAYMENT_NONE, PAYMENT_PENDING, PAYMENT_SKIPPED, PAYMENT_SUCCEEDED,
};

const INVALID_TRANSITION: &str = "onboarding.invalid_transition";

/// key: onboarding-engine -> staged signup with atomic commit
#[derive(Clone)]
pub struct OnboardingEngine {
    pool: PgPool,
    config: Arc<Config>,
    stripe: Arc<StripeClient>,
    oauth: Arc<GoogleOauthClient>,
    mailer: Arc<dyn Mailer>,
}

/// Everything the atomic commit creates, returned in one shape so the API
/// can mint a login for the new admin.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub workspace: Workspace,
    pub user: User,
    pub business: Business,
    pub subscription: Subscription,
}

impl OnboardingEngine {
    pub fn new(
        pool: PgPool,
        config: Arc<Config>,
        stripe: Arc<StripeClient>,
        oauth: Arc<GoogleOauthClient>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            pool,
            config,
            stripe,
            oauth,
            mailer,
        }
    }

    /// Opaque 128-bit-minimum session token; not derivable from user data.
    fn new_token() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn hash_otp(otp: &str) -> String {
        hex::encode(Sha256::digest(otp.as_bytes()))
    }

    fn new_otp() -> String {
        let mut bytes = [0u8; 4];
        OsRng.fill_bytes(&mut bytes);
        format!("{:06}", u32::from_be_bytes(bytes) % 1_000_000)
    }

    pub async fn start_session(&self, plan_code: &str) -> AppResult<OnboardingSession> {
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE code = $1 AND active = TRUE",
        )
        .bind(plan_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::not_found("billing.plan_not_found"))?;

        let ttl = Duration::seconds(self.config.onboarding.session_ttl_seconds);
        let session = sqlx::query_as::<_, OnboardingSession>(
            "INSERT INTO onboarding_sessions \
             (id, token, plan_id, plan_code, paid_plan, payment_status, stage, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(Self::new_token())
        .bind(plan.id)
        .bind(&plan.code)
        .bind(plan.is_paid())
        .bind(PAYMENT_NONE)
        .bind(Stage::PlanSelected.as_str())
        .bind(Utc::now() + ttl)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(session)
    }

    /// Resume lookup. Expired or unknown tokens are indistinguishable.
    pub async fn load(&self, token: &str) -> AppResult<OnboardingSession> {
        let session = sqlx::query_as::<_, OnboardingSession>(
            "SELECT * FROM onboarding_sessions WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::not_found("onboarding.session_not_found"))?;
        if session.is_expired(Utc::now()) {
            return Err(AppError::not_found("onboarding.session_not_found"));
        }
        Ok(session)
    }

    async fn load_mutable(&self, token: &str) -> AppResult<OnboardingSession> {
        let session = self.load(token).await?;
        if session.stage() == Stage::Committed {
            return Err(AppError::invalid_transition(
                INVALID_TRANSITION,
                "session is already committed",
            ));
        }
        Ok(session)
    }

    fn ensure_transition(
        session: &OnboardingSession,
        to: Stage,
    ) -> AppResult<()> {
        if !session.stage().can_transition(to, session.paid_plan) {
            return Err(AppError::invalid_transition(
                INVALID_TRANSITION,
                format!("cannot move from {} to {}", session.stage, to.as_str()),
            ));
        }
        Ok(())
    }

    /// Attach an email and issue an OTP. If the email already has another
    /// active session, that one is resumed instead of creating a parallel
    /// signup.
    pub async fn attach_email(&self, token: &str, email: &str) -> AppResult<OnboardingSession> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(AppError::validation(
                "onboarding.invalid_email",
                "a valid email address is required",
            ));
        }

        let registered: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE email = $1")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::from)?;
        if registered.is_some() {
            return Err(AppError::conflict(
                "onboarding.email_in_use",
                "this email already belongs to a workspace",
            ));
        }

        let session = self.load_mutable(token).await?;

        let existing = sqlx::query_as::<_, OnboardingSession>(
            "SELECT * FROM onboarding_sessions \
             WHERE email = $1 AND stage <> $2 AND committed_at IS NULL AND expires_at > NOW() \
               AND token <> $3 \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(&email)
        .bind(Stage::Committed.as_str())
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        if let Some(existing) = existing {
            // Parallel signup for the same email resumes the earlier session.
            return self.issue_otp(existing).await;
        }

        // Re-posting while identity is pending corrects the email and
        // re-issues the code without a stage change.
        if session.stage() != Stage::IdentityPending {
            Self::ensure_transition(&session, Stage::IdentityPending)?;
        }
        let session = sqlx::query_as::<_, OnboardingSession>(
            "UPDATE onboarding_sessions \
             SET email = $2, identity_provider = 'password', stage = $3, updated_at = NOW() \
             WHERE token = $1 RETURNING *",
        )
        .bind(token)
        .bind(&email)
        .bind(Stage::IdentityPending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        self.issue_otp(session).await
    }

    async fn issue_otp(&self, session: OnboardingSession) -> AppResult<OnboardingSession> {
        let otp = Self::new_otp();
        let session = sqlx::query_as::<_, OnboardingSession>(
            "UPDATE onboarding_sessions SET otp_hash = $2, updated_at = NOW() \
             WHERE token = $1 RETURNING *",
        )
        .bind(&session.token)
        .bind(Self::hash_otp(&otp))
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;

        let email = session.email.clone().unwrap_or_default();
        if let Err(err) = self
            .mailer
            .send(
                &email,
                "Your Kyora verification code",
                &format!("Your verification code is {otp}. It expires with your signup session."),
            )
            .await
        {
            tracing::warn!(?err, "failed to deliver verification code");
        }
        Ok(session)
    }

    /// OTP match marks the email verified and stores the pending identity.
    /// A mismatch changes nothing.
    pub async fn verify_identity(
        &self,
        token: &str,
        otp: &str,
        full_name: &str,
        password: &str,
    ) -> AppResult<OnboardingSession> {
        let session = self.load_mutable(token).await?;
        Self::ensure_transition(&session, Stage::IdentityVerified)?;

        let stored = session
            .otp_hash
            .as_deref()
            .ok_or_else(|| AppError::validation("onboarding.invalid_code", "no code issued"))?;
        if stored != Self::hash_otp(otp.trim()) {
            return Err(AppError::validation(
                "onboarding.invalid_code",
                "the verification code does not match",
            ));
        }
        if full_name.trim().is_empty() {
            return Err(AppError::validation(
                "onboarding.invalid_name",
                "full name is required",
            ));
        }
        if password.len() < 8 {
            return Err(AppError::validation(
                "onboarding.weak_password",
                "password must be at least 8 characters",
            ));
        }

        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| AppError::Internal(anyhow::anyhow!("hashing failed: {err}")))?
            .to_string();

        let session = sqlx::query_as::<_, OnboardingSession>(
            "UPDATE onboarding_sessions \
             SET email_verified = TRUE, pending_full_name = $2, pending_password_hash = $3, \
                 otp_hash = NULL, stage = $4, updated_at = NOW() \
             WHERE token = $1 RETURNING *",
        )
        .bind(token)
        .bind(full_name.trim())
        .bind(hash)
        .bind(Stage::IdentityVerified.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(session)
    }

    /// OAuth variant of the identity stage: the auth URL doubles as the
    /// verification token issue.
    pub async fn start_google_identity(&self, token: &str) -> AppResult<String> {
        let session = self.load_mutable(token).await?;
        Self::ensure_transition(&session, Stage::IdentityPending)?;
        let url = self.oauth.auth_url(token)?;
        sqlx::query(
            "UPDATE onboarding_sessions \
             SET identity_provider = 'google', stage = $2, updated_at = NOW() WHERE token = $1",
        )
        .bind(token)
        .bind(Stage::IdentityPending.as_str())
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(url)
    }

    pub async fn complete_google_identity(
        &self,
        token: &str,
        code: &str,
    ) -> AppResult<OnboardingSession> {
        let session = self.load_mutable(token).await?;
        Self::ensure_transition(&session, Stage::IdentityVerified)?;

        let identity = self.oauth.exchange_code(code).await?;
        if !identity.email_verified {
            return Err(AppError::validation(
                "onboarding.unverified_google_email",
                "the Google account email is not verified",
            ));
        }
        let email = identity.email.trim().to_lowercase();

        let registered: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE email = $1")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::from)?;
        if registered.is_some() {
            return Err(AppError::conflict(
                "onboarding.email_in_use",
                "this email already belongs to a workspace",
            ));
        }

        let session = sqlx::query_as::<_, OnboardingSession>(
            "UPDATE onboarding_sessions \
             SET email = $2, email_verified = TRUE, pending_full_name = $3, \
                 identity_provider = 'google', stage = $4, updated_at = NOW() \
             WHERE token = $1 RETURNING *",
        )
        .bind(token)
        .bind(&email)
        .bind(&identity.name)
        .bind(Stage::IdentityVerified.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(session)
    }

    /// Record the staged business. Descriptor uniqueness against committed
    /// businesses is deliberately not checked here; commit re-checks it.
    pub async fn stage_business(
        &self,
        token: &str,
        name: &str,
        descriptor: &str,
        country: &str,
        currency: &str,
    ) -> AppResult<OnboardingSession> {
        let session = self.load_mutable(token).await?;
        let stage = session.stage();
        // Field edits are allowed while still staged; only the first call
        // advances the stage.
        let advances = stage == Stage::IdentityVerified;
        if advances {
            Self::ensure_transition(&session, Stage::BusinessStaged)?;
        } else if !matches!(stage, Stage::BusinessStaged | Stage::ReadyToCommit) {
            return Err(AppError::invalid_transition(
                INVALID_TRANSITION,
                format!("cannot stage a business from {}", session.stage),
            ));
        }

        if name.trim().is_empty() {
            return Err(AppError::validation(
                "business.invalid_name",
                "business name is required",
            ));
        }
        tenancy::validate_descriptor(descriptor)?;
        if country.trim().len() != 2 || currency.trim().len() != 3 {
            return Err(AppError::validation(
                "business.invalid_locale",
                "country must be ISO 3166-1 alpha-2 and currency ISO 4217",
            ));
        }

        let next_stage = if advances {
            Stage::BusinessStaged.as_str()
        } else {
            session.stage.as_str()
        };
        let session = sqlx::query_as::<_, OnboardingSession>(
            "UPDATE onboarding_sessions \
             SET business_name = $2, business_descriptor = $3, business_country = $4, \
                 business_currency = $5, stage = $6, updated_at = NOW() \
             WHERE token = $1 RETURNING *",
        )
        .bind(token)
        .bind(name.trim())
        .bind(descriptor)
        .bind(country.trim().to_uppercase())
        .bind(currency.trim().to_uppercase())
        .bind(next_stage)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(session)
    }

    /// Paid plans go through the provider checkout; the session token rides
    /// in the checkout metadata so the webhook can find its way back.
    pub async fn begin_payment(&self, token: &str) -> AppResult<OnboardingSession> {
        let session = self.load_mutable(token).await?;
        Self::ensure_transition(&session, Stage::PaymentPending)?;

        let plan_id = session
            .plan_id
            .ok_or_else(|| AppError::validation("onboarding.no_plan", "no plan selected"))?;
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::from)?;
        let price_id = plan.provider_price_id.as_deref().ok_or_else(|| {
            AppError::external("provider.stripe", "plan has no provider price; run sync-plans")
        })?;

        let base = self.config.http.base_url.trim_end_matches('/');
        let checkout = self
            .stripe
            .create_checkout_session(
                price_id,
                token,
                &format!("{base}/onboarding/complete"),
                &format!("{base}/onboarding/canceled"),
            )
            .await?;

        let session = sqlx::query_as::<_, OnboardingSession>(
            "UPDATE onboarding_sessions \
             SET provider_checkout_id = $2, provider_checkout_url = $3, payment_status = $4, \
                 stage = $5, updated_at = NOW() \
             WHERE token = $1 RETURNING *",
        )
        .bind(token)
        .bind(&checkout.id)
        .bind(&checkout.url)
        .bind(PAYMENT_PENDING)
        .bind(Stage::PaymentPending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(session)
    }

    /// Driven by the billing webhook subscriber, never by a client call.
    pub async fn confirm_payment(
        &self,
        token: &str,
        provider_subscription_id: &str,
    ) -> AppResult<OnboardingSession> {
        let session = self.load_mutable(token).await?;
        Self::ensure_transition(&session, Stage::PaymentConfirmed)?;
        let session = sqlx::query_as::<_, OnboardingSession>(
            "UPDATE onboarding_sessions \
             SET payment_status = $2, provider_subscription_id = $3, stage = $4, \
                 updated_at = NOW() \
             WHERE token = $1 RETURNING *",
        )
        .bind(token)
        .bind(PAYMENT_SUCCEEDED)
        .bind(provider_subscription_id)
        .bind(Stage::PaymentConfirmed.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(session)
    }

    pub async fn mark_ready(&self, token: &str) -> AppResult<OnboardingSession> {
        let session = self.load_mutable(token).await?;
        Self::ensure_transition(&session, Stage::ReadyToCommit)?;
        if session.business_descriptor.is_none() {
            return Err(AppError::validation(
                "onboarding.incomplete",
                "business details are missing",
            ));
        }
        let payment_status = if session.paid_plan {
            session.payment_status.clone()
        } else {
            PAYMENT_SKIPPED.to_string()
        };
        let session = sqlx::query_as::<_, OnboardingSession>(
            "UPDATE onboarding_sessions \
             SET stage = $2, payment_status = $3, updated_at = NOW() \
             WHERE token = $1 RETURNING *",
        )
        .bind(token)
        .bind(Stage::ReadyToCommit.as_str())
        .bind(payment_status)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(session)
    }

    /// The atomic commit: one transaction creates workspace, admin user,
    /// business and subscription, then seals the session. Any failure rolls
    /// everything back and the session stays retryable at ready_to_commit.
    pub async fn commit(&self, token: &str) -> AppResult<CommitOutcome> {
        let session = self.load_mutable(token).await?;
        Self::ensure_transition(&session, Stage::Committed)?;

        let email = session
            .email
            .clone()
            .filter(|_| session.email_verified)
            .ok_or_else(|| {
                AppError::validation("onboarding.incomplete", "verified email is missing")
            })?;
        let full_name = session.pending_full_name.clone().unwrap_or_default();
        let descriptor = session.business_descriptor.clone().ok_or_else(|| {
            AppError::validation("onboarding.incomplete", "business details are missing")
        })?;
        let plan_id = session
            .plan_id
            .ok_or_else(|| AppError::validation("onboarding.incomplete", "no plan selected"))?;

        let mut tx = self.pool.begin().await.map_err(AppError::from)?;

        // Descriptor re-check against committed businesses; staging skipped it.
        let taken: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM businesses WHERE descriptor = $1")
                .bind(&descriptor)
                .fetch_optional(&mut *tx)
                .await
                .map_err(AppError::from)?;
        if taken.is_some() {
            return Err(AppError::conflict(
                "storage.unique_violation",
                "the business descriptor is already taken",
            ));
        }

        let workspace = sqlx::query_as::<_, Workspace>(
            "INSERT INTO workspaces (id, name) VALUES ($1, $2) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(session.business_name.as_deref().unwrap_or("Workspace"))
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users \
             (id, workspace_id, email, full_name, password_hash, role, enabled, email_verified, identity_provider) \
             VALUES ($1, $2, $3, $4, $5, $6, TRUE, TRUE, $7) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(workspace.id)
        .bind(&email)
        .bind(&full_name)
        .bind(&session.pending_password_hash)
        .bind(ROLE_ADMIN)
        .bind(session.identity_provider.as_deref().unwrap_or("password"))
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let business = sqlx::query_as::<_, Business>(
            "INSERT INTO businesses (id, workspace_id, descriptor, name, country, currency) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(workspace.id)
        .bind(&descriptor)
        .bind(session.business_name.as_deref().unwrap_or(""))
        .bind(session.business_country.as_deref().unwrap_or("US"))
        .bind(session.business_currency.as_deref().unwrap_or("USD"))
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let subscription = sqlx::query_as::<_, Subscription>(
            "INSERT INTO subscriptions \
             (id, workspace_id, plan_id, status, provider_subscription_id, current_period_start) \
             VALUES ($1, $2, $3, $4, $5, NOW()) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(workspace.id)
        .bind(plan_id)
        .bind(STATUS_ACTIVE)
        .bind(&session.provider_subscription_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            "UPDATE onboarding_sessions \
             SET stage = $2, committed_at = NOW(), updated_at = NOW() WHERE token = $1",
        )
        .bind(token)
        .bind(Stage::Committed.as_str())
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        tx.commit().await.map_err(AppError::from)?;

        tracing::info!(
            workspace = %workspace.id,
            business = %business.id,
            "onboarding session committed"
        );

        Ok(CommitOutcome {
            workspace,
            user,
            business,
            subscription,
        })
    }

    pub async fn delete(&self, token: &str) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM onboarding_sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("onboarding.session_not_found"));
        }
        Ok(())
    }
}

/// Wire the engine to the billing webhook flow: a verified checkout
/// completion advances the session's payment stage.
pub fn subscribe_payment_confirmations(
    builder: &mut crate::events::EventBusBuilder,
    engine: OnboardingEngine,
) {
    use crate::events::{Event, Topic};
    builder.subscribe(Topic::OnboardingPaymentSucceeded, move |event| {
        let engine = engine.clone();
        Box::pin(async move {
            let Event::OnboardingPaymentSucceeded {
                session_token,
                provider_subscription_id,
            } = event
            else {
                return Ok(());
            };
            engine
                .confirm_payment(&session_token, &provider_subscription_id)
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from)
        })
    });
}
