//! Charon control-plane server

use anyhow::Context;
use clap::Parser;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use charon_cloud::{ApiKeySource, CloudProvider, CloudResult, LambdaCloud, LocalCloud};
use charon_core::{AppConfig, FileStore, Store};
use charon_server::auth::{JwksVerifier, StaticTokenVerifier, TokenVerifier};
use charon_server::{api, state::AppState};

#[derive(Parser, Debug)]
#[command(name = "charon-server", version, about = "Self-service GPU instance control plane")]
struct Args {
    /// Path to a YAML config file (defaults to charon.yaml, then
    /// ~/.charon/config.yaml, then built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    bind: Option<String>,
}

/// Reads the upstream API key from settings on every call, so rotating it
/// through the admin endpoint needs no restart
struct StoreKeySource {
    store: Store,
}

#[async_trait::async_trait]
impl ApiKeySource for StoreKeySource {
    async fn api_key(&self) -> CloudResult<String> {
        let settings = self
            .store
            .settings()
            .await
            .map_err(|e| charon_cloud::CloudError::Transient(e.to_string()))?;
        if settings.lambda_api_key.is_empty() {
            return Err(charon_cloud::CloudError::Unauthorized(
                "no upstream API key configured".into(),
            ));
        }
        Ok(settings.lambda_api_key)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from_file(path).await?,
        None => AppConfig::load_default().await?,
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    let config = Arc::new(config);

    let file_store = FileStore::open(&config.data_dir)
        .await
        .with_context(|| format!("opening state store at {}", config.data_dir.display()))?;
    let store = Store::new(Arc::new(file_store));

    ensure_seed_secret(&store).await?;

    let cloud: Arc<dyn CloudProvider> = if config.local_cloud {
        warn!("Running against the in-process local cloud; no real VMs will be launched");
        Arc::new(LocalCloud::with_default_catalog())
    } else {
        Arc::new(LambdaCloud::new(
            config.provider_base_url.clone(),
            Arc::new(StoreKeySource {
                store: store.clone(),
            }),
        )?)
    };

    let verifier: Arc<dyn TokenVerifier> = if config.local_cloud {
        // Dev convenience: the bearer token is the email itself
        warn!("Local mode: accepting admin emails as bearer tokens");
        let mut dev = StaticTokenVerifier::new();
        for email in &config.admin_emails {
            dev = dev.with_token(email.clone(), email.clone(), email.clone());
        }
        Arc::new(dev)
    } else {
        anyhow::ensure!(
            !config.jwks_url.is_empty(),
            "jwksUrl must be configured (or enable localCloud for development)"
        );
        Arc::new(JwksVerifier::new(
            config.jwks_url.clone(),
            config.jwt_issuer.clone(),
            config.jwt_audience.clone(),
        ))
    };

    let state = AppState::new(store, cloud, config.clone(), verifier);

    // The reconciler shares no memory with the handlers; everything meets
    // in the store
    tokio::spawn(state.reconciler().run_loop());

    let app = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(
        bind = %config.bind_addr,
        base_url = %config.base_url,
        version = charon_server::VERSION,
        "Charon control plane listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Generate the seed-complete bearer secret on first start
async fn ensure_seed_secret(store: &Store) -> anyhow::Result<()> {
    let mut settings = store.settings().await?;
    if settings.seed_complete_secret.is_empty() {
        settings.seed_complete_secret = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(48)
            .map(char::from)
            .collect();
        store.put_settings(&settings).await?;
        info!("Generated seed-complete secret");
    }
    Ok(())
}
