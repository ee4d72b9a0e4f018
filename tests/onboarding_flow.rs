use std::sync::Arc;

use chrono::{Duration, Utc};
use kyora::billing::StripeClient;
use kyora::config::Config;
use kyora::mailer::MockMailer;
use kyora::oauth::GoogleOauthClient;
use kyora::onboarding::{sweep_sessions, OnboardingEngine, Stage};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

// key: onboarding-tests -> staged signup, atomic commit, sweep

fn engine(pool: &PgPool) -> OnboardingEngine {
    let config = Arc::new(Config::load_from(None, &[]).unwrap());
    OnboardingEngine::new(
        pool.clone(),
        config.clone(),
        Arc::new(StripeClient::new(&config.billing.stripe)),
        Arc::new(GoogleOauthClient::new(config.auth.google_oauth.clone())),
        Arc::new(MockMailer),
    )
}

async fn seed_free_plan(pool: &PgPool) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO plans (id, code, name, amount_cents, max_team_members, max_businesses, max_orders_per_month) \
         VALUES ($1, 'free', 'Free', 0, 1, 1, 50)",
    )
    .bind(id)
    .execute(pool)
    .await
    .unwrap();
    id
}

/// Force the session's OTP to a known value so the test can verify it.
async fn force_otp(pool: &PgPool, token: &str, otp: &str) {
    let hash = hex::encode(Sha256::digest(otp.as_bytes()));
    sqlx::query("UPDATE onboarding_sessions SET otp_hash = $2 WHERE token = $1")
        .bind(token)
        .bind(hash)
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn free_plan_flow_commits_atomically(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_free_plan(&pool).await;
    let engine = engine(&pool);

    let session = engine.start_session("free").await.unwrap();
    assert_eq!(session.stage(), Stage::PlanSelected);
    assert!(session.token.len() >= 43, "token must be at least 128 bits");

    let session = engine
        .attach_email(&session.token, "Owner@Example.com ")
        .await
        .unwrap();
    assert_eq!(session.stage(), Stage::IdentityPending);
    assert_eq!(session.email.as_deref(), Some("owner@example.com"));

    force_otp(&pool, &session.token, "123456").await;
    let session = engine
        .verify_identity(&session.token, "123456", "Amina Diallo", "s3cret-pass")
        .await
        .unwrap();
    assert_eq!(session.stage(), Stage::IdentityVerified);
    assert!(session.email_verified);

    let session = engine
        .stage_business(&session.token, "Amina Threads", "amina-threads", "sn", "xof")
        .await
        .unwrap();
    assert_eq!(session.stage(), Stage::BusinessStaged);

    let session = engine.mark_ready(&session.token).await.unwrap();
    assert_eq!(session.stage(), Stage::ReadyToCommit);
    assert_eq!(session.payment_status, "skipped");

    let outcome = engine.commit(&session.token).await.unwrap();
    assert_eq!(outcome.user.role, "admin");
    assert_eq!(outcome.business.descriptor, "amina-threads");
    assert_eq!(outcome.subscription.status, "active");
    assert_eq!(outcome.user.workspace_id, outcome.workspace.id);

    let committed = sqlx::query_as::<_, (String, Option<chrono::DateTime<Utc>>)>(
        "SELECT stage, committed_at FROM onboarding_sessions WHERE token = $1",
    )
    .bind(&session.token)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(committed.0, "committed");
    assert!(committed.1.is_some());

    let workspaces: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workspaces")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(workspaces.0, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn commit_conflict_leaves_session_retryable(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_free_plan(&pool).await;
    let engine = engine(&pool);

    // A concurrent signup already took the descriptor.
    let other_workspace = Uuid::new_v4();
    sqlx::query("INSERT INTO workspaces (id, name) VALUES ($1, 'Rival')")
        .bind(other_workspace)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO businesses (id, workspace_id, descriptor, name) \
         VALUES ($1, $2, 'amina-threads', 'Rival Threads')",
    )
    .bind(Uuid::new_v4())
    .bind(other_workspace)
    .execute(&pool)
    .await
    .unwrap();

    let session = engine.start_session("free").await.unwrap();
    engine
        .attach_email(&session.token, "amina@example.com")
        .await
        .unwrap();
    force_otp(&pool, &session.token, "654321").await;
    engine
        .verify_identity(&session.token, "654321", "Amina Diallo", "s3cret-pass")
        .await
        .unwrap();
    engine
        .stage_business(&session.token, "Amina Threads", "amina-threads", "sn", "xof")
        .await
        .unwrap();
    engine.mark_ready(&session.token).await.unwrap();

    let err = engine.commit(&session.token).await.unwrap_err();
    assert_eq!(err.code(), "storage.unique_violation");

    // Nothing was half-created and the session can retry.
    let session = engine.load(&session.token).await.unwrap();
    assert_eq!(session.stage(), Stage::ReadyToCommit);
    let users: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(users.0, 0);

    engine
        .stage_business(&session.token, "Amina Threads", "amina-threads-2", "sn", "xof")
        .await
        .unwrap();
    let outcome = engine.commit(&session.token).await.unwrap();
    assert_eq!(outcome.business.descriptor, "amina-threads-2");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn otp_mismatch_changes_nothing(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_free_plan(&pool).await;
    let engine = engine(&pool);

    let session = engine.start_session("free").await.unwrap();
    engine
        .attach_email(&session.token, "amina@example.com")
        .await
        .unwrap();
    force_otp(&pool, &session.token, "111111").await;

    let err = engine
        .verify_identity(&session.token, "999999", "Amina", "s3cret-pass")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "onboarding.invalid_code");

    let session = engine.load(&session.token).await.unwrap();
    assert_eq!(session.stage(), Stage::IdentityPending);
    assert!(!session.email_verified);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn out_of_order_transitions_conflict(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_free_plan(&pool).await;
    let engine = engine(&pool);

    let session = engine.start_session("free").await.unwrap();
    // Cannot stage a business before the identity is verified.
    let err = engine
        .stage_business(&session.token, "Shop", "shop", "sn", "xof")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "onboarding.invalid_transition");
    // Cannot commit from plan_selected.
    let err = engine.commit(&session.token).await.unwrap_err();
    assert_eq!(err.code(), "onboarding.invalid_transition");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_email_resumes_existing_session(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_free_plan(&pool).await;
    let engine = engine(&pool);

    let first = engine.start_session("free").await.unwrap();
    let first = engine
        .attach_email(&first.token, "amina@example.com")
        .await
        .unwrap();

    let second = engine.start_session("free").await.unwrap();
    let resumed = engine
        .attach_email(&second.token, "amina@example.com")
        .await
        .unwrap();
    assert_eq!(resumed.token, first.token, "the earlier session is resumed");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn sweep_removes_expired_and_stale_committed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let plan_id = seed_free_plan(&pool).await;
    let now = Utc::now();

    // Expired, never committed.
    sqlx::query(
        "INSERT INTO onboarding_sessions (id, token, plan_id, paid_plan, expires_at) \
         VALUES ($1, 'expired-token', $2, FALSE, $3)",
    )
    .bind(Uuid::new_v4())
    .bind(plan_id)
    .bind(now - Duration::hours(1))
    .execute(&pool)
    .await
    .unwrap();

    // Committed two days ago.
    sqlx::query(
        "INSERT INTO onboarding_sessions (id, token, plan_id, paid_plan, stage, expires_at, committed_at) \
         VALUES ($1, 'old-committed', $2, FALSE, 'committed', $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(plan_id)
    .bind(now + Duration::hours(1))
    .bind(now - Duration::hours(48))
    .execute(&pool)
    .await
    .unwrap();

    // Still live.
    sqlx::query(
        "INSERT INTO onboarding_sessions (id, token, plan_id, paid_plan, expires_at) \
         VALUES ($1, 'live-token', $2, FALSE, $3)",
    )
    .bind(Uuid::new_v4())
    .bind(plan_id)
    .bind(now + Duration::hours(12))
    .execute(&pool)
    .await
    .unwrap();

    let removed = sweep_sessions(&pool, now).await.unwrap();
    assert_eq!(removed, 2);

    let remaining: Vec<(String,)> = sqlx::query_as("SELECT token FROM onboarding_sessions")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, vec![("live-token".to_string(),)]);
}
