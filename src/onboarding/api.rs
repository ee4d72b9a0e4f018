use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::error::AppResult;
use crate::extractor::issue_access_token;

use super::engine::OnboardingEngine;
use super::models::SessionView;

/// key: onboarding-api -> public signup endpoints

pub fn routes() -> Router {
    Router::new()
        .route("/v1/onboarding/sessions", post(start_session))
        .route(
            "/v1/onboarding/sessions/:token",
            get(get_session).delete(delete_session),
        )
        .route("/v1/onboarding/sessions/:token/email", post(attach_email))
        .route("/v1/onboarding/sessions/:token/verify", post(verify_identity))
        .route(
            "/v1/onboarding/sessions/:token/google",
            post(start_google).put(complete_google),
        )
        .route("/v1/onboarding/sessions/:token/business", post(stage_business))
        .route("/v1/onboarding/sessions/:token/checkout", post(begin_payment))
        .route("/v1/onboarding/sessions/:token/ready", post(mark_ready))
        .route("/v1/onboarding/sessions/:token/commit", post(commit))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub plan_code: String,
}

async fn start_session(
    Extension(engine): Extension<OnboardingEngine>,
    Json(payload): Json<StartSessionRequest>,
) -> AppResult<(StatusCode, Json<SessionView>)> {
    let session = engine.start_session(&payload.plan_code).await?;
    Ok((StatusCode::CREATED, Json(SessionView::from(&session))))
}

async fn get_session(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
) -> AppResult<Json<SessionView>> {
    let session = engine.load(&token).await?;
    Ok(Json(SessionView::from(&session)))
}

async fn delete_session(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
) -> AppResult<StatusCode> {
    engine.delete(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct AttachEmailRequest {
    pub email: String,
}

async fn attach_email(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
    Json(payload): Json<AttachEmailRequest>,
) -> AppResult<Json<SessionView>> {
    let session = engine.attach_email(&token, &payload.email).await?;
    Ok(Json(SessionView::from(&session)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyIdentityRequest {
    pub otp: String,
    pub full_name: String,
    pub password: String,
}

async fn verify_identity(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
    Json(payload): Json<VerifyIdentityRequest>,
) -> AppResult<Json<SessionView>> {
    let session = engine
        .verify_identity(&token, &payload.otp, &payload.full_name, &payload.password)
        .await?;
    Ok(Json(SessionView::from(&session)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleUrlResponse {
    pub auth_url: String,
}

async fn start_google(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
) -> AppResult<Json<GoogleUrlResponse>> {
    let auth_url = engine.start_google_identity(&token).await?;
    Ok(Json(GoogleUrlResponse { auth_url }))
}

#[derive(Deserialize)]
pub struct GoogleCallbackRequest {
    pub code: String,
}

async fn complete_google(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
    Json(payload): Json<GoogleCallbackRequest>,
) -> AppResult<Json<SessionView>> {
    let session = engine.complete_google_identity(&token, &payload.code).await?;
    Ok(Json(SessionView::from(&session)))
}

#[derive(Deserialize)]
pub struct StageBusinessRequest {
    pub name: String,
    pub descriptor: String,
    pub country: String,
    pub currency: String,
}

async fn stage_business(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
    Json(payload): Json<StageBusinessRequest>,
) -> AppResult<Json<SessionView>> {
    let session = engine
        .stage_business(
            &token,
            &payload.name,
            &payload.descriptor,
            &payload.country,
            &payload.currency,
        )
        .await?;
    Ok(Json(SessionView::from(&session)))
}

async fn begin_payment(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
) -> AppResult<Json<SessionView>> {
    let session = engine.begin_payment(&token).await?;
    Ok(Json(SessionView::from(&session)))
}

async fn mark_ready(
    Extension(engine): Extension<OnboardingEngine>,
    Path(token): Path<String>,
) -> AppResult<Json<SessionView>> {
    let session = engine.mark_ready(&token).await?;
    Ok(Json(SessionView::from(&session)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    pub workspace_id: uuid::Uuid,
    pub business_descriptor: String,
    pub access_token: String,
}

async fn commit(
    Extension(engine): Extension<OnboardingEngine>,
    Extension(config): Extension<Arc<Config>>,
    Path(token): Path<String>,
) -> AppResult<(StatusCode, Json<CommitResponse>)> {
    let outcome = engine.commit(&token).await?;
    let access_token =
        issue_access_token(&config.auth.jwt, outcome.user.id, outcome.workspace.id)?;
    Ok((
        StatusCode::CREATED,
        Json(CommitResponse {
            workspace_id: outcome.workspace.id,
            business_descriptor: outcome.business.descriptor,
            access_token,
        }),
    ))
}
