use anyhow::{Context, Result};
use crm_broker::api::{create_router, AppState};
use crm_broker::config::{load_config, BrokerConfig};
use crm_broker::credentials::{
    ConnectionRegistry, ConnectionStore, MemoryConnectionStore, SecretStore, SqliteConnectionStore,
};
use crm_broker::executor::CallExecutor;
use crm_broker::oauth::{
    run_state_cleanup, AuthorizationFlow, OAuthProviderConfig, ProviderClient, StateManager,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crm_broker=info".into()),
        )
        .init();

    info!("CRM broker starting...");

    let mut config = match std::env::var("BROKER_CONFIG") {
        Ok(path) => load_config(&path).with_context(|| format!("Failed to load config {}", path))?,
        Err(_) => BrokerConfig::default(),
    };
    config.apply_env();
    config
        .validate()
        .context("Refusing to start with incomplete configuration")?;

    info!(
        redirect_uri = %config.oauth.redirect_uri(),
        pkce = config.oauth.pkce_enabled,
        api_version = %config.api.version,
        port = config.server.port,
        "Configuration loaded"
    );

    let store: Arc<dyn ConnectionStore> = match &config.vault.credentials_db {
        Some(path) => {
            let store = SqliteConnectionStore::new(path)
                .with_context(|| format!("Failed to open credentials database {}", path))?;
            info!(path = %path, "SQLite connection store initialized");
            Arc::new(store)
        }
        None => {
            warn!("BROKER_CREDENTIALS_DB not set, connections are kept in memory only");
            Arc::new(MemoryConnectionStore::new())
        }
    };

    let secrets = SecretStore::new(&config.vault.master_secret)
        .context("Failed to initialize secret store")?;
    let registry = Arc::new(ConnectionRegistry::new(store, secrets));

    let timeout = Duration::from_secs(config.api.request_timeout_seconds);
    let provider = Arc::new(
        ProviderClient::new(OAuthProviderConfig::from_config(&config.oauth), timeout)
            .context("Failed to build provider client")?,
    );

    let states = StateManager::new(config.oauth.state_ttl_seconds);
    tokio::spawn(run_state_cleanup(
        states.clone(),
        config.oauth.state_cleanup_interval_seconds,
    ));

    let flow = Arc::new(AuthorizationFlow::new(provider, states, Arc::clone(&registry)));
    let executor = Arc::new(
        CallExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&flow),
            config.api.version.clone(),
            timeout,
        )
        .context("Failed to build call executor")?,
    );

    let router = create_router(AppState {
        flow,
        registry,
        executor,
        callback_path: config.oauth.callback_route(),
        cors_allowed_origins: config.server.cors_allowed_origins.clone(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .context("Failed to bind broker port")?;
    info!(port = config.server.port, "Broker API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Broker API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("CRM broker stopped");

    Ok(())
}
