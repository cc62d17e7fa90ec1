use std::sync::Arc;
use std::time::Duration;

use prism_llm::governance::persistence::{ConfigStore, MemoryConfigStore, SqliteConfigStore};
use prism_llm::{
    AdminCredential, GatewayConfig, Governance, OpenAiCompatibleProvider, ProviderRegistry,
    SessionManager, SystemClock, UpstreamDialect,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().ok_or(
        "usage: prism-gateway <config.json> [--listen HOST:PORT] [--store governance.db] [--admin-token TOKEN] [--admin-user USER:PASSWORD]",
    )?;

    let mut listen = "127.0.0.1:8080".to_string();
    let mut store_path: Option<String> = None;
    let mut admin_token: Option<String> = None;
    let mut admin_credential: Option<AdminCredential> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--store" => {
                store_path = Some(args.next().ok_or("missing value for --store")?);
            }
            "--admin-token" => {
                admin_token = Some(args.next().ok_or("missing value for --admin-token")?);
            }
            "--admin-user" => {
                let spec = args.next().ok_or("missing value for --admin-user")?;
                let (user, password) = spec
                    .split_once(':')
                    .ok_or("admin user spec must be USER:PASSWORD")?;
                admin_credential = Some(AdminCredential::new(user, password));
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    prism_llm::telemetry::init_tracing();

    let raw = std::fs::read_to_string(&config_path)?;
    let config: GatewayConfig = serde_json::from_str(&raw)?;
    config.validate()?;

    let config_store: Arc<dyn ConfigStore> = match &store_path {
        Some(path) => {
            let store = SqliteConfigStore::new(path);
            store.init().await?;
            Arc::new(store)
        }
        None => Arc::new(MemoryConfigStore::new()),
    };

    let clock = Arc::new(SystemClock);
    let governance = Arc::new(
        Governance::load(
            config_store.clone(),
            clock.clone(),
            Duration::from_millis(config.usage_flush_interval_ms),
        )
        .await?,
    );

    let mut registry = ProviderRegistry::new();
    for provider in &config.providers {
        let mut adapter = OpenAiCompatibleProvider::new(&provider.name, &provider.runtime);
        if provider.dialect.as_deref() == Some("responses") {
            adapter = adapter.with_dialect(UpstreamDialect::Responses);
        }
        registry.register(
            provider.name.clone(),
            Arc::new(adapter),
            provider.runtime.clone(),
            provider.keys.clone(),
        )?;
    }

    let gateway = Arc::new(prism_llm::Gateway::with_default_plugins(
        Arc::new(registry),
        governance.clone(),
    ));
    gateway.init().await?;

    let sessions = Arc::new(SessionManager::new(config_store, clock, admin_credential));
    let mut state = prism_llm::GatewayHttpState::new(gateway.clone(), governance, sessions);
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }

    let app = prism_llm::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "prism-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Teardown flushes pending usage deltas through the plugin chain.
    gateway.shutdown().await;
    Ok(())
}
