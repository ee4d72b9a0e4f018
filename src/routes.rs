use axum::routing::get;
use axum::Router;

use crate::{accounting, auth, billing, onboarding, orders, workspaces};

async fn healthz() -> &'static str {
    "ok"
}

async fn livez() -> &'static str {
    "ok"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
        .merge(auth::routes())
        .merge(workspaces::routes())
        .merge(onboarding::api::routes())
        .merge(accounting::api::routes())
        .merge(billing::api::routes())
        .merge(billing::webhooks::routes())
        .merge(orders::routes())
}
