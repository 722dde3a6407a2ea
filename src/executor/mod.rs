//! Authenticated CRM API calls with transparent access token refresh.
//!
//! Every call reads the caller's connection, injects the access token as a
//! bearer credential and, when the provider reports an invalid session,
//! refreshes once, persists the new token and retries once. A failure after
//! the retry is returned as-is.

use dashmap::DashMap;
use reqwest::{Client, Method, Url};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{Connection, ConnectionKey, ConnectionRegistry, Environment, RotateOutcome};
use crate::error::{BrokerError, Result};
use crate::oauth::AuthorizationFlow;

/// Provider error code meaning the session (access token) is no longer valid
const INVALID_SESSION_ID: &str = "INVALID_SESSION_ID";

/// Status and decoded body of a CRM API response.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// HTTP 401, or an `INVALID_SESSION_ID` error code in the body.
    pub fn indicates_invalid_session(&self) -> bool {
        if self.status == 401 {
            return true;
        }
        if self.is_success() {
            return false;
        }

        let error = match &self.body {
            Value::Array(errors) => errors.first(),
            other => Some(other),
        };
        error
            .and_then(|e| e.get("errorCode"))
            .and_then(Value::as_str)
            .is_some_and(|code| code == INVALID_SESSION_ID)
    }
}

/// Executes CRM REST calls on behalf of a connected user.
pub struct CallExecutor {
    registry: Arc<ConnectionRegistry>,
    flow: Arc<AuthorizationFlow>,
    http: Client,
    api_version: String,
    refresh_guards: DashMap<ConnectionKey, Arc<Mutex<()>>>,
}

impl CallExecutor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        flow: Arc<AuthorizationFlow>,
        api_version: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("crm-broker/0.1")
            .build()
            .map_err(|e| BrokerError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            registry,
            flow,
            http,
            api_version: api_version.into(),
            refresh_guards: DashMap::new(),
        })
    }

    /// Run `method path` against the user's instance under
    /// `/services/data/<version>`.
    ///
    /// Fails with [`BrokerError::NotConnected`] before any network call when
    /// the user has no connection for `environment`, and with
    /// [`BrokerError::InvalidPath`] when `path` resolves outside the data API. Non-success statuses are
    /// returned in the [`ApiResponse`], not as errors.
    pub async fn execute(
        &self,
        user_key: &str,
        environment: Environment,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let key = ConnectionKey::new(user_key, environment);
        let connection = self.registry.get(&key)?.ok_or(BrokerError::NotConnected)?;
        let url = self.api_url(&connection.instance_url, path)?;

        let response = self
            .send(&url, &connection.access_token, &method, body)
            .await?;

        if !response.indicates_invalid_session() {
            return Ok(response);
        }

        debug!(
            user_key = %user_key,
            environment = %environment,
            status = response.status,
            "Session invalid, refreshing access token"
        );

        let access_token = self.refresh_connection(&key, &connection).await?;
        let retried = self.send(&url, &access_token, &method, body).await?;

        if retried.indicates_invalid_session() {
            warn!(
                user_key = %user_key,
                environment = %environment,
                status = retried.status,
                "Session still invalid after refresh"
            );
        }

        Ok(retried)
    }

    /// Refresh the access token for `key`, once per stale token.
    ///
    /// Callers racing on the same key wait for the first refresh and reuse its
    /// token instead of refreshing again. The guard entry is dropped once no
    /// caller holds or waits on it.
    async fn refresh_connection(&self, key: &ConnectionKey, stale: &Connection) -> Result<String> {
        let guard = self
            .refresh_guards
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let result = {
            let _singleflight = guard.lock().await;
            self.refresh_locked(key, stale).await
        };

        drop(guard);
        self.refresh_guards
            .remove_if(key, |_, guard| Arc::strong_count(guard) == 1);

        result
    }

    async fn refresh_locked(&self, key: &ConnectionKey, stale: &Connection) -> Result<String> {
        let current = self.registry.get(key)?.ok_or(BrokerError::NotConnected)?;
        if current.access_token != stale.access_token {
            debug!(user_key = %key.user_key, environment = %key.environment, "Access token already refreshed");
            return Ok(current.access_token);
        }

        let refreshed = self
            .flow
            .refresh(key.environment, &current.refresh_token)
            .await
            .map_err(|e| {
                warn!(user_key = %key.user_key, environment = %key.environment, error = %e, "Token refresh failed");
                e
            })?;

        let outcome = self.registry.rotate_access_token(
            key,
            current.updated_at,
            refreshed.access_token,
            refreshed.refresh_token,
        )?;

        match outcome {
            RotateOutcome::Rotated(connection) => {
                info!(user_key = %key.user_key, environment = %key.environment, "Access token refreshed");
                Ok(connection.access_token)
            }
            RotateOutcome::Superseded(connection) => Ok(connection.access_token),
            RotateOutcome::Missing => Err(BrokerError::NotConnected),
        }
    }

    /// Resolve `path` against the instance's versioned data API.
    ///
    /// The check runs on the parsed URL, after dot segments, percent-encoded
    /// dots and backslashes have been normalized.
    fn api_url(&self, instance_url: &str, path: &str) -> Result<Url> {
        let raw = format!(
            "{}/services/data/{}{}{}",
            instance_url.trim_end_matches('/'),
            self.api_version,
            if path.starts_with('/') { "" } else { "/" },
            path
        );
        let url = Url::parse(&raw).map_err(|_| BrokerError::InvalidPath(path.to_string()))?;

        let prefix = format!("/services/data/{}/", self.api_version);
        if !url.path().starts_with(&prefix) || url.fragment().is_some() {
            return Err(BrokerError::InvalidPath(path.to_string()));
        }

        Ok(url)
    }

    async fn send(
        &self,
        url: &Url,
        access_token: &str,
        method: &Method,
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(access_token)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        Ok(ApiResponse {
            status,
            body: decode_body(&text),
        })
    }
}

/// JSON when possible, the raw text otherwise, `null` when empty.
fn decode_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ConnectionFields, MemoryConnectionStore, SecretStore, TokenPair};
    use crate::oauth::{OAuthProviderConfig, ProviderClient, StateManager};
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    const ACCOUNTS_PATH: &str = "/services/data/v59.0/sobjects/Account";
    const EXPIRED_SESSION: &str =
        r#"[{"message":"Session expired or invalid","errorCode":"INVALID_SESSION_ID"}]"#;

    fn create_executor(server: &ServerGuard) -> (CallExecutor, Arc<ConnectionRegistry>) {
        let config = OAuthProviderConfig {
            production_login_url: server.url(),
            sandbox_login_url: server.url(),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            redirect_uri: "https://broker.example.com/oauth/callback".to_string(),
            scopes: vec!["api".to_string(), "refresh_token".to_string()],
            pkce_enabled: true,
        };
        let provider = Arc::new(ProviderClient::new(config, Duration::from_secs(5)).unwrap());
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(MemoryConnectionStore::new()),
            SecretStore::new("test-master-secret").unwrap(),
        ));
        let flow = Arc::new(AuthorizationFlow::new(
            provider,
            StateManager::new(600),
            Arc::clone(&registry),
        ));
        let executor =
            CallExecutor::new(Arc::clone(&registry), flow, "v59.0", Duration::from_secs(5)).unwrap();
        (executor, registry)
    }

    fn connect(registry: &ConnectionRegistry, server: &ServerGuard, user_key: &str) -> ConnectionKey {
        let key = ConnectionKey::new(user_key, Environment::Production);
        registry
            .put(
                &key,
                ConnectionFields {
                    instance_url: server.url(),
                    identity_url: format!("{}/id/00D/005", server.url()),
                    org_id: "00D".to_string(),
                    tokens: TokenPair {
                        access_token: "old".to_string(),
                        refresh_token: "refresh-1".to_string(),
                    },
                },
            )
            .unwrap();
        key
    }

    fn response(status: u16, body: Value) -> ApiResponse {
        ApiResponse { status, body }
    }

    #[test]
    fn test_invalid_session_detection() {
        assert!(response(401, Value::Null).indicates_invalid_session());
        assert!(response(
            400,
            json!([{"message": "Session expired or invalid", "errorCode": "INVALID_SESSION_ID"}])
        )
        .indicates_invalid_session());
        assert!(response(403, json!({"errorCode": "INVALID_SESSION_ID"})).indicates_invalid_session());

        assert!(!response(200, json!({"errorCode": "INVALID_SESSION_ID"})).indicates_invalid_session());
        assert!(!response(400, json!([{"errorCode": "MALFORMED_QUERY"}])).indicates_invalid_session());
        assert!(!response(500, json!("Internal error")).indicates_invalid_session());
        assert!(!response(404, json!([])).indicates_invalid_session());
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(""), Value::Null);
        assert_eq!(decode_body(r#"{"id":"001"}"#), json!({"id": "001"}));
        assert_eq!(decode_body("Bad gateway"), json!("Bad gateway"));
    }

    #[test]
    fn test_is_success() {
        assert!(response(200, Value::Null).is_success());
        assert!(response(204, Value::Null).is_success());
        assert!(!response(302, Value::Null).is_success());
        assert!(!response(401, Value::Null).is_success());
    }

    #[tokio::test]
    async fn test_not_connected_makes_no_call() {
        let mut server = Server::new_async().await;
        let (executor, _) = create_executor(&server);

        let api = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let result = executor
            .execute("nobody", Environment::Production, Method::GET, "/sobjects/Account", None)
            .await;

        assert!(matches!(result, Err(BrokerError::NotConnected)));
        api.assert_async().await;
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        let key = connect(&registry, &server, "alice");

        let api = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer old")
            .with_status(200)
            .with_body(r#"{"objectDescribe":{"name":"Account"}}"#)
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/services/oauth2/token")
            .expect(0)
            .create_async()
            .await;

        let response = executor
            .execute("alice", Environment::Production, Method::GET, "/sobjects/Account", None)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body["objectDescribe"]["name"], "Account");
        assert_eq!(registry.get(&key).unwrap().unwrap().access_token, "old");

        api.assert_async().await;
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_session_refreshes_and_retries_once() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        let key = connect(&registry, &server, "alice");

        let stale = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer old")
            .with_status(401)
            .with_body(EXPIRED_SESSION)
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/services/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"new","instance_url":"https://ignored.example.com"}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body(r#"{"totalSize":0,"records":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let response = executor
            .execute("alice", Environment::Production, Method::GET, "/sobjects/Account", None)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"totalSize": 0, "records": []}));

        let stored = registry.get(&key).unwrap().unwrap();
        assert_eq!(stored.access_token, "new");
        // Not rotated by the provider, so the old one stays
        assert_eq!(stored.refresh_token, "refresh-1");

        assert!(executor.refresh_guards.is_empty());

        stale.assert_async().await;
        token.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_session_body_triggers_refresh() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        let key = connect(&registry, &server, "alice");

        let _stale = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer old")
            .with_status(400)
            .with_body(EXPIRED_SESSION)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/services/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"new","refresh_token":"refresh-2"}"#)
            .expect(1)
            .create_async()
            .await;
        let _fresh = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let response = executor
            .execute("alice", Environment::Production, Method::GET, "/sobjects/Account", None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        // Rotated refresh token is adopted
        let stored = registry.get(&key).unwrap().unwrap();
        assert_eq!(stored.access_token, "new");
        assert_eq!(stored.refresh_token, "refresh-2");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_rejection_is_returned_without_another_refresh() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        connect(&registry, &server, "alice");

        let _stale = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer old")
            .with_status(401)
            .with_body(EXPIRED_SESSION)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/services/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"new"}"#)
            .expect(1)
            .create_async()
            .await;
        let retried = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer new")
            .with_status(401)
            .with_body(EXPIRED_SESSION)
            .expect(1)
            .create_async()
            .await;

        let response = executor
            .execute("alice", Environment::Production, Method::GET, "/sobjects/Account", None)
            .await
            .unwrap();

        assert_eq!(response.status, 401);
        assert!(response.indicates_invalid_session());
        token.assert_async().await;
        retried.assert_async().await;
    }

    #[tokio::test]
    async fn test_other_failures_do_not_refresh() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        connect(&registry, &server, "alice");

        let api = server
            .mock("GET", ACCOUNTS_PATH)
            .with_status(500)
            .with_body("Internal Server Error")
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/services/oauth2/token")
            .expect(0)
            .create_async()
            .await;

        let response = executor
            .execute("alice", Environment::Production, Method::GET, "/sobjects/Account", None)
            .await
            .unwrap();

        assert_eq!(response.status, 500);
        assert_eq!(response.body, json!("Internal Server Error"));
        api.assert_async().await;
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_and_keeps_tokens() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        let key = connect(&registry, &server, "alice");

        let _stale = server
            .mock("GET", ACCOUNTS_PATH)
            .with_status(401)
            .with_body(EXPIRED_SESSION)
            .expect(1)
            .create_async()
            .await;
        let _token = server
            .mock("POST", "/services/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"expired access/refresh token"}"#)
            .create_async()
            .await;

        let result = executor
            .execute("alice", Environment::Production, Method::GET, "/sobjects/Account", None)
            .await;

        match result {
            Err(BrokerError::RefreshFailed { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let stored = registry.get(&key).unwrap().unwrap();
        assert_eq!(stored.access_token, "old");
        assert_eq!(stored.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn test_post_body_and_relative_path() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        connect(&registry, &server, "alice");

        let api = server
            .mock("POST", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer old")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"Name": "Acme"})))
            .with_status(201)
            .with_body(r#"{"id":"001xx000003DGb2AAG","success":true,"errors":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let body = json!({"Name": "Acme"});
        let response = executor
            .execute(
                "alice",
                Environment::Production,
                Method::POST,
                "sobjects/Account",
                Some(&body),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body["id"], "001xx000003DGb2AAG");
        api.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_expired_calls_refresh_once() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        let key = connect(&registry, &server, "alice");

        let _stale = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer old")
            .with_status(401)
            .with_body(EXPIRED_SESSION)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/services/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"new"}"#)
            .expect(1)
            .create_async()
            .await;
        let _fresh = server
            .mock("GET", ACCOUNTS_PATH)
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let (first, second) = tokio::join!(
            executor.execute("alice", Environment::Production, Method::GET, "/sobjects/Account", None),
            executor.execute("alice", Environment::Production, Method::GET, "/sobjects/Account", None),
        );

        assert_eq!(first.unwrap().status, 200);
        assert_eq!(second.unwrap().status, 200);
        assert_eq!(registry.get(&key).unwrap().unwrap().access_token, "new");
        assert!(executor.refresh_guards.is_empty());
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_paths_resolving_outside_data_api_are_rejected() {
        let mut server = Server::new_async().await;
        let (executor, registry) = create_executor(&server);
        connect(&registry, &server, "alice");

        let any = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        for path in [
            "/%2e%2e/%2e%2e/oauth2/userinfo",
            "/%2E%2E/%2E%2E/oauth2/token",
            "/\\..\\..\\oauth2/userinfo",
            "/../../oauth2/userinfo",
            "/sobjects/../../../oauth2/token",
        ] {
            let result = executor
                .execute("alice", Environment::Production, Method::GET, path, None)
                .await;
            assert!(
                matches!(result, Err(BrokerError::InvalidPath(_))),
                "{} was not rejected",
                path
            );
        }

        any.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_url_resolution() {
        let server = Server::new_async().await;
        let (executor, _) = create_executor(&server);
        let instance = format!("{}/", server.url());

        let url = executor.api_url(&instance, "sobjects/Account").unwrap();
        assert_eq!(url.path(), "/services/data/v59.0/sobjects/Account");

        let url = executor.api_url(&instance, "/sobjects/../limits").unwrap();
        assert_eq!(url.path(), "/services/data/v59.0/limits");

        let url = executor
            .api_url(&instance, "/query?q=SELECT+Id+FROM+Account")
            .unwrap();
        assert_eq!(url.path(), "/services/data/v59.0/query");
        assert_eq!(url.query(), Some("q=SELECT+Id+FROM+Account"));

        assert!(executor.api_url(&instance, "/..").is_err());
        assert!(executor.api_url(&instance, "/limits#x").is_err());
    }
}
