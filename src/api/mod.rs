//! HTTP surface of the broker.
//!
//! Every route except `/health` and the OAuth callback identifies its caller
//! with the `X-User-Key` header. Errors render as
//! `{"error": {"code": "...", "message": "..."}}`.

mod connections;
mod oauth;
mod request;

use axum::{
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, warn};

use crate::auth::UserKeyError;
use crate::config::normalize_route;
use crate::credentials::ConnectionRegistry;
use crate::error::BrokerError;
use crate::executor::CallExecutor;
use crate::oauth::AuthorizationFlow;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<AuthorizationFlow>,
    pub registry: Arc<ConnectionRegistry>,
    pub executor: Arc<CallExecutor>,
    /// Route the provider redirects back to
    pub callback_path: String,
    pub cors_allowed_origins: Vec<String>,
}

/// Create the broker router
pub fn create_router(state: AppState) -> Router {
    let callback_path = normalize_route(&state.callback_path);
    let cors = cors_layer(&state.cors_allowed_origins);

    let router = Router::new()
        .route("/health", get(health))
        .route("/oauth/start", get(oauth::oauth_start))
        .route(&callback_path, get(oauth::oauth_callback))
        .route("/api/connections", get(connections::list_connections))
        .route(
            "/api/connections/:env",
            get(connections::get_connection).delete(connections::revoke_connection),
        )
        .route("/api/request", post(request::execute_request))
        .with_state(Arc::new(state));

    match cors {
        Some(layer) => router.layer(layer),
        None => router,
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-user-key")]),
    )
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

/// Application error types
pub(crate) enum AppError {
    Broker(BrokerError),
    Unauthorized(UserKeyError),
    BadRequest(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Broker(e) => match e {
                BrokerError::InvalidOrExpiredState
                | BrokerError::ProviderDenied { .. }
                | BrokerError::MissingParameter(_)
                | BrokerError::InvalidPath(_) => StatusCode::BAD_REQUEST,
                BrokerError::NotConnected => StatusCode::NOT_FOUND,
                BrokerError::TokenExchangeFailed { .. }
                | BrokerError::RefreshFailed { .. }
                | BrokerError::IdentityLookupFailed { .. }
                | BrokerError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
                BrokerError::Transport(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
                BrokerError::Transport(_) => StatusCode::BAD_GATEWAY,
                BrokerError::Integrity
                | BrokerError::Configuration(_)
                | BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Broker(e) => e.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Unauthorized(e) => e.to_string(),
            AppError::BadRequest(msg) => msg.clone(),
            // Backend details stay in the logs
            AppError::Broker(BrokerError::Storage(_)) => "Credential storage unavailable".to_string(),
            AppError::Broker(e) => e.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            if let AppError::Broker(e) = &self {
                error!(code = e.code(), error = %e, "Request failed");
            }
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.message(),
            },
        });

        (status, body).into_response()
    }
}

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        AppError::Broker(e)
    }
}

impl From<UserKeyError> for AppError {
    fn from(e: UserKeyError) -> Self {
        AppError::Unauthorized(e)
    }
}
