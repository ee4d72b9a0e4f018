use std::str::FromStr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{middleware, Extension};
use kyora::billing::StripeClient;
use kyora::config::Config;
use kyora::events::EventBus;
use kyora::extractor::issue_access_token;
use kyora::mailer::MockMailer;
use kyora::oauth::GoogleOauthClient;
use kyora::onboarding::OnboardingEngine;
use kyora::pipeline;
use kyora::routes::api_routes;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

// key: isolation-tests -> cross-tenant 404, plan-limit gate

fn test_config() -> Arc<Config> {
    let vars = vec![(
        "KYORA_AUTH__JWT__SECRET".to_string(),
        "test-secret".to_string(),
    )];
    Arc::new(Config::load_from(None, &vars).unwrap())
}

fn app(pool: PgPool, config: Arc<Config>) -> axum::Router {
    let mailer: Arc<dyn kyora::mailer::Mailer> = Arc::new(MockMailer);
    let stripe = Arc::new(StripeClient::new(&config.billing.stripe));
    let oauth = Arc::new(GoogleOauthClient::new(config.auth.google_oauth.clone()));
    let engine = OnboardingEngine::new(
        pool.clone(),
        config.clone(),
        stripe.clone(),
        oauth.clone(),
        mailer.clone(),
    );
    api_routes()
        .layer(middleware::from_fn(pipeline::body_limit))
        .layer(Extension(pool))
        .layer(Extension(config))
        .layer(Extension(EventBus::builder().start()))
        .layer(Extension(engine))
        .layer(Extension(stripe))
        .layer(Extension(oauth))
        .layer(Extension(mailer))
}

struct Tenant {
    workspace_id: Uuid,
    user_id: Uuid,
    business_descriptor: String,
}

async fn seed_tenant(pool: &PgPool, tag: &str, plan_id: Uuid) -> Tenant {
    let workspace_id = Uuid::new_v4();
    sqlx::query("INSERT INTO workspaces (id, name) VALUES ($1, $2)")
        .bind(workspace_id)
        .bind(format!("Workspace {tag}"))
        .execute(pool)
        .await
        .unwrap();
    let user_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO users (id, workspace_id, email, full_name, role, enabled, email_verified) \
         VALUES ($1, $2, $3, $4, 'admin', TRUE, TRUE)",
    )
    .bind(user_id)
    .bind(workspace_id)
    .bind(format!("owner-{tag}@example.com"))
    .bind(format!("Owner {tag}"))
    .execute(pool)
    .await
    .unwrap();
    let descriptor = format!("shop-{tag}");
    sqlx::query(
        "INSERT INTO businesses (id, workspace_id, descriptor, name) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(&descriptor)
    .bind(format!("Shop {tag}"))
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO subscriptions (id, workspace_id, plan_id, status, current_period_start) \
         VALUES ($1, $2, $3, 'active', NOW())",
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(plan_id)
    .execute(pool)
    .await
    .unwrap();
    Tenant {
        workspace_id,
        user_id,
        business_descriptor: descriptor,
    }
}

async fn seed_plan(pool: &PgPool) -> Uuid {
    let plan_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO plans (id, code, name, amount_cents, max_team_members, max_businesses, max_orders_per_month) \
         VALUES ($1, 'starter', 'Starter', 900, 3, 1, 500)",
    )
    .bind(plan_id)
    .execute(pool)
    .await
    .unwrap();
    plan_id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cross_tenant_reads_are_indistinguishable_from_missing(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let config = test_config();
    let plan_id = seed_plan(&pool).await;
    let one = seed_tenant(&pool, "one", plan_id).await;
    let two = seed_tenant(&pool, "two", plan_id).await;

    let business_one: (Uuid,) =
        sqlx::query_as("SELECT id FROM businesses WHERE descriptor = $1")
            .bind(&one.business_descriptor)
            .fetch_one(&pool)
            .await
            .unwrap();
    let order_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO orders (id, business_id, total, cost_of_goods, currency, status, occurred_on) \
         VALUES ($1, $2, $3, 0, 'USD', 'paid', NOW()::date)",
    )
    .bind(order_id)
    .bind(business_one.0)
    .bind(Decimal::from_str("50.00").unwrap())
    .execute(&pool)
    .await
    .unwrap();

    let app = app(pool.clone(), config.clone());

    // The owner sees the order.
    let own_token = issue_access_token(&config.auth.jwt, one.user_id, one.workspace_id).unwrap();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/v1/businesses/{}/orders/{order_id}",
                    one.business_descriptor
                ))
                .header("Authorization", format!("Bearer {own_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A foreign workspace gets a 404, never a 403.
    let foreign_token =
        issue_access_token(&config.auth.jwt, two.user_id, two.workspace_id).unwrap();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/v1/businesses/{}/orders/{order_id}",
                    one.business_descriptor
                ))
                .header("Authorization", format!("Bearer {foreign_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let problem: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(problem["code"], "tenant.not_found");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn invitation_blocked_at_team_member_limit(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let config = test_config();
    let plan_id = seed_plan(&pool).await;
    let tenant = seed_tenant(&pool, "limit", plan_id).await;

    // Fill the workspace to the cap of three enabled members.
    for n in 0..2 {
        sqlx::query(
            "INSERT INTO users (id, workspace_id, email, full_name, role, enabled, email_verified) \
             VALUES ($1, $2, $3, 'Member', 'user', TRUE, TRUE)",
        )
        .bind(Uuid::new_v4())
        .bind(tenant.workspace_id)
        .bind(format!("member-{n}@example.com"))
        .execute(&pool)
        .await
        .unwrap();
    }

    let app = app(pool.clone(), config.clone());
    let token =
        issue_access_token(&config.auth.jwt, tenant.user_id, tenant.workspace_id).unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/workspaces/invitations")
                .header("Authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"email":"fourth@example.com"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let problem: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(problem["code"], "billing.plan_limit_exceeded");
    assert_eq!(problem["feature"], "maxTeamMembers");
    assert_eq!(problem["limit"], 3);
    assert_eq!(problem["observed"], 3);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn disabled_user_cannot_authenticate(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let config = test_config();
    let plan_id = seed_plan(&pool).await;
    let tenant = seed_tenant(&pool, "off", plan_id).await;
    sqlx::query("UPDATE users SET enabled = FALSE WHERE id = $1")
        .bind(tenant.user_id)
        .execute(&pool)
        .await
        .unwrap();

    let app = app(pool.clone(), config.clone());
    let token =
        issue_access_token(&config.auth.jwt, tenant.user_id, tenant.workspace_id).unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/users/me")
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
