use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::oauth::parse_environment;
use super::{AppError, AppState};
use crate::auth::extract_user_key;
use crate::credentials::{ConnectionKey, ConnectionSummary, Environment};
use crate::error::BrokerError;

#[derive(Serialize)]
pub(super) struct ConnectionListResponse {
    environments: Vec<Environment>,
}

/// GET /api/connections - Environments the caller has connected
pub(super) async fn list_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ConnectionListResponse>, AppError> {
    let user_key = extract_user_key(&headers)?;
    let environments = state.registry.list_by_user(&user_key)?;

    Ok(Json(ConnectionListResponse { environments }))
}

/// GET /api/connections/:env - Connection summary, 404 when not connected
pub(super) async fn get_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(env): Path<String>,
) -> Result<Json<ConnectionSummary>, AppError> {
    let user_key = extract_user_key(&headers)?;
    let key = ConnectionKey::new(user_key, parse_environment(&env)?);

    let connection = state.registry.get(&key)?.ok_or(BrokerError::NotConnected)?;

    Ok(Json(connection.summary()))
}

/// DELETE /api/connections/:env - Forget the stored connection
///
/// Idempotent: 204 whether or not a connection existed.
pub(super) async fn revoke_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(env): Path<String>,
) -> Result<StatusCode, AppError> {
    let user_key = extract_user_key(&headers)?;
    let key = ConnectionKey::new(user_key, parse_environment(&env)?);

    let existed = state.registry.revoke(&key)?;

    info!(
        user_key = %key.user_key,
        environment = %key.environment,
        existed = existed,
        "Connection revoked"
    );

    Ok(StatusCode::NO_CONTENT)
}
