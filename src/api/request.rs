use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::Json,
};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::oauth::parse_environment;
use super::{AppError, AppState};
use crate::auth::extract_user_key;
use crate::executor::ApiResponse;

/// Methods accepted for proxied calls
const ALLOWED_METHODS: [&str; 5] = ["GET", "POST", "PATCH", "PUT", "DELETE"];

/// POST /api/request body
#[derive(Debug, Deserialize)]
pub(super) struct ApiRequest {
    env: String,
    method: String,
    path: String,
    #[serde(default)]
    body: Option<Value>,
}

/// POST /api/request - Authenticated call against the caller's CRM instance
///
/// The upstream status is returned in the body, so a 4xx from the CRM is
/// still a 200 here.
pub(super) async fn execute_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ApiRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>, AppError> {
    let user_key = extract_user_key(&headers)?;
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let environment = parse_environment(&request.env)?;
    let method = parse_method(&request.method)?;
    validate_path(&request.path)?;

    debug!(
        user_key = %user_key,
        environment = %environment,
        method = %method,
        path = %request.path,
        "Executing API request"
    );

    let response = state
        .executor
        .execute(
            &user_key,
            environment,
            method,
            &request.path,
            request.body.as_ref(),
        )
        .await?;

    Ok(Json(response))
}

fn parse_method(value: &str) -> Result<Method, AppError> {
    let upper = value.to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&upper.as_str()) {
        return Err(AppError::BadRequest(format!(
            "Unsupported method '{}'",
            value
        )));
    }
    Method::from_bytes(upper.as_bytes())
        .map_err(|_| AppError::BadRequest(format!("Unsupported method '{}'", value)))
}

/// Paths stay relative to the versioned data API. The executor checks the
/// resolved URL again before sending.
fn validate_path(path: &str) -> Result<(), AppError> {
    let route = path.split('?').next().unwrap_or_default();
    let invalid = path.is_empty()
        || path.starts_with("//")
        || path.contains("://")
        || path.contains('#')
        || route.contains('\\')
        || route.to_ascii_lowercase().contains("%2e")
        || path.chars().any(char::is_control)
        || path
            .split(['/', '?'])
            .any(|segment| segment == ".." || segment == ".");

    if invalid {
        return Err(AppError::BadRequest(format!("Invalid API path '{}'", path)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("get").ok(), Some(Method::GET));
        assert_eq!(parse_method("PATCH").ok(), Some(Method::PATCH));
        assert!(parse_method("TRACE").is_err());
        assert!(parse_method("").is_err());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/sobjects/Account").is_ok());
        assert!(validate_path("sobjects/Account/001xx000003DGb2AAG").is_ok());
        assert!(validate_path("/query?q=SELECT+Id+FROM+Account").is_ok());
        assert!(validate_path("/query?q=SELECT+Id+FROM+Contact+WHERE+Email='a%2Eb@acme.com'").is_ok());

        assert!(validate_path("").is_err());
        assert!(validate_path("/../../services/oauth2/token").is_err());
        assert!(validate_path("/sobjects/./Account").is_err());
        assert!(validate_path("//evil.example.com/x").is_err());
        assert!(validate_path("/x?next=https://evil.example.com").is_err());
        assert!(validate_path("/sobjects#frag").is_err());
        assert!(validate_path("/%2e%2e/%2e%2e/oauth2/userinfo").is_err());
        assert!(validate_path("/%2E./oauth2/userinfo").is_err());
        assert!(validate_path("/\\..\\..\\oauth2/userinfo").is_err());
    }
}
