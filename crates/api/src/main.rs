use std::sync::Arc;

use anyhow::Context;

use hopline_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hopline_observability::init();

    let config = ApiConfig::from_env().context("invalid api configuration")?;
    let services = hopline_api::app::services::build_services(&config).await?;
    let app = hopline_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}
