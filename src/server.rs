/// HTTP surface: the Telegram webhook plus the endpoints the web application calls.
use crate::bot::{DeliveryMode, Gateway, SendOutcome};
use crate::code::generate_code;
use crate::config::Config;
use crate::error::Result;
use crate::messenger::FailureReason;
use crate::store::{Account, Store};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

const HEALTH_PATH: &str = "/healthz";
const SEND_CODE_PATH: &str = "/api/telegram/send-code";
const VERIFY_PATH: &str = "/api/telegram/verify";
const AUTH_SUCCESS_PATH: &str = "/api/telegram/auth-success";

/// Routes the webhook path must not shadow.
pub const RESERVED_PATHS: [&str; 4] = [HEALTH_PATH, SEND_CODE_PATH, VERIFY_PATH, AUTH_SUCCESS_PATH];

/// Shared state for every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub store: Arc<Store>,
    pub config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
pub struct SendCodeRequest {
    pub phone: String,
    pub telegram_id: i64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SendCodeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl From<SendOutcome> for SendCodeResponse {
    fn from(outcome: SendOutcome) -> Self {
        match outcome {
            SendOutcome::Delivered {
                message_id,
                verification_id,
            } => Self {
                success: true,
                message_id: Some(message_id),
                verification_id: Some(verification_id),
                reason: None,
            },
            SendOutcome::Failed { reason } => Self {
                success: false,
                message_id: None,
                verification_id: None,
                reason: Some(reason),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub phone: String,
    pub code: String,
    /// Profile to link to the Telegram user once the code checks out.
    #[serde(default)]
    pub account: Option<Account>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct VerifyResponse {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AuthSuccessRequest {
    pub telegram_id: i64,
    pub display_name: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AuthSuccessResponse {
    pub queued: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ready: bool,
    pub mode: Option<DeliveryMode>,
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route(HEALTH_PATH, get(healthz))
        .route(SEND_CODE_PATH, post(send_code))
        .route(VERIFY_PATH, post(verify))
        .route(AUTH_SUCCESS_PATH, post(auth_success));
    if state.gateway.mode() == Some(DeliveryMode::Webhook) {
        app = app.route(&state.config.webhook_path, post(webhook));
    }
    app.with_state(state)
}

/// Serve HTTP until `shutdown` resolves.
pub async fn serve<F>(state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = state.config.listen_addr;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn authorize(config: &Config, headers: &HeaderMap) -> std::result::Result<(), StatusCode> {
    let Some(key) = &config.internal_api_key else {
        return Ok(());
    };
    let expected = format!("Bearer {}", key);
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        warn!("Rejected internal API call with a missing or wrong key");
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ready: state.gateway.session().is_some(),
        mode: state.gateway.mode(),
    })
}

async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    if let Some(secret) = &state.config.webhook_secret {
        let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(secret.as_str()) {
            warn!("Rejected webhook call with a missing or wrong secret token");
            return StatusCode::UNAUTHORIZED;
        }
    }

    match state.gateway.process_raw_update(&body).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!("Rejected webhook payload: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

async fn send_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendCodeRequest>,
) -> std::result::Result<Json<SendCodeResponse>, StatusCode> {
    authorize(&state.config, &headers)?;

    let code = generate_code(&mut OsRng);
    let outcome = state
        .gateway
        .send_verification_code(&request.phone, &code, request.telegram_id)
        .await;
    Ok(Json(outcome.into()))
}

async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<VerifyRequest>,
) -> std::result::Result<Json<VerifyResponse>, StatusCode> {
    authorize(&state.config, &headers)?;

    let now = Utc::now();
    let record = match state
        .store
        .verify_code(
            request.phone.trim(),
            request.code.trim(),
            now,
            state.config.verify_max_attempts,
        )
    {
        Ok(record) => record,
        Err(e) => {
            error!("Failed to check verification code: {}", e);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let Some(record) = record else {
        return Ok(Json(VerifyResponse {
            verified: false,
            telegram_id: None,
        }));
    };

    info!(verification_id = record.id, telegram_id = record.telegram_id, "Code verified");
    if let Some(account) = &request.account {
        if let Err(e) = state.store.link_account(record.telegram_id, account, now) {
            warn!(telegram_id = record.telegram_id, "Failed to link account: {}", e);
        }
        state
            .gateway
            .send_auth_success_notification(record.telegram_id, &account.display_name);
    }

    Ok(Json(VerifyResponse {
        verified: true,
        telegram_id: Some(record.telegram_id),
    }))
}

async fn auth_success(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuthSuccessRequest>,
) -> std::result::Result<Json<AuthSuccessResponse>, StatusCode> {
    authorize(&state.config, &headers)?;

    let queued = state
        .gateway
        .send_auth_success_notification(request.telegram_id, &request.display_name);
    Ok(Json(AuthSuccessResponse { queued }))
}
