use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::{AppError, AppState};
use crate::auth::extract_user_key;
use crate::credentials::{ConnectionSummary, Environment};
use crate::error::BrokerError;
use crate::oauth::CallbackParams;

#[derive(Deserialize)]
pub(super) struct StartParams {
    env: Option<String>,
}

/// Parse an `env` path or query value
pub(super) fn parse_environment(value: &str) -> Result<Environment, AppError> {
    value.parse().map_err(AppError::BadRequest)
}

/// GET /oauth/start?env=
///
/// Redirects the caller to the provider's authorization page.
pub(super) async fn oauth_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<StartParams>,
) -> Result<Redirect, AppError> {
    let user_key = extract_user_key(&headers)?;
    let env = params.env.ok_or(BrokerError::MissingParameter("env"))?;
    let environment = parse_environment(&env)?;

    let auth_url = state.flow.start(&user_key, environment)?;

    info!(user_key = %user_key, environment = %environment, "Redirecting to OAuth provider");

    Ok(Redirect::temporary(&auth_url))
}

/// GET <callback_path>
///
/// Resolves the provider redirect and stores the connection. The response
/// carries the connection summary, never tokens.
pub(super) async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<ConnectionSummary>, AppError> {
    debug!(
        has_code = params.code.is_some(),
        has_error = params.error.is_some(),
        "OAuth callback received"
    );

    let connection = state.flow.complete_callback(params).await?;

    Ok(Json(connection.summary()))
}
