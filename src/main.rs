//! ModeloMan hub server entry point.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use modeloman::clock::{SystemClock, UuidGen};
use modeloman::config::Config;
use modeloman::db::libsql::LibSqlBackend;
use modeloman::db::{AgentKeyStore, HubStore};
use modeloman::rpc::http;
use modeloman::rpc::interceptors::HubRpc;
use modeloman::rpc::ratelimit::{RateLimiterConfig, TokenBucketRateLimiter};
use modeloman::service::HubService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let backend = LibSqlBackend::new_local(Path::new(&config.store_path))
        .await
        .with_context(|| format!("opening store at {}", config.store_path))?;
    let store: Arc<dyn HubStore> = Arc::new(backend);
    store.run_migrations().await?;
    store.verify_schema_ready().await?;

    if let Some(raw_key) = &config.bootstrap_agent_key {
        let (key_id, created) = store
            .ensure_agent_key(&config.bootstrap_agent_id, raw_key)
            .await?;
        tracing::info!(
            agent_id = %config.bootstrap_agent_id,
            key_id = %key_id,
            created,
            "bootstrapped agent key"
        );
    }

    let data_source = format!("libsql:{}", config.store_path);
    let hub = Arc::new(HubService::new(
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(UuidGen),
        data_source,
    ));
    let rpc = Arc::new(HubRpc::new(
        hub,
        store,
        TokenBucketRateLimiter::new(RateLimiterConfig::default()),
        config.auth_token.clone(),
        config.allow_legacy_auth,
    ));

    let app = http::router(rpc);
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;
    tracing::info!(addr = %config.http_addr, "modeloman hub listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
