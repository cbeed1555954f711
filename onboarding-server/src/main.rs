use std::sync::Arc;

use anyhow::{bail, Context};
use onboarding_core::{EngineConfig, HttpBackend, MemoryBackend, OnboardingBackend, OnboardingEngine};
use onboarding_server::settings::{BackendKind, ServerSettings};
use onboarding_server::{create_router, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("onboarding_server=info,onboarding_core=info,tower_http=debug")
        }))
        .init();

    let settings = ServerSettings::from_env()?;
    let config = EngineConfig::from_env().context("loading engine configuration")?;

    let backend: Arc<dyn OnboardingBackend> = match settings.backend {
        BackendKind::Http => {
            if config.system_user_id.is_none() {
                bail!("SYSTEM_USER_ID must be set for the http backend");
            }
            Arc::new(HttpBackend::new(&config).context("building http backend")?)
        }
        BackendKind::Memory => {
            tracing::warn!("using in-memory backend; onboarding state is not persisted");
            Arc::new(MemoryBackend::new())
        }
    };

    tracing::info!(
        api_url = %config.api_url,
        job_runner = config.job_runner.url.as_deref().unwrap_or("<unset>"),
        batch_config_validation = config.batch_config_validation,
        "engine configured"
    );

    let engine = Arc::new(OnboardingEngine::with_backend(backend, config));
    let app = create_router(AppState { engine });

    let listener = tokio::net::TcpListener::bind(&settings.addr)
        .await
        .with_context(|| format!("binding {}", settings.addr))?;
    tracing::info!("onboarding server listening on {}", settings.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
