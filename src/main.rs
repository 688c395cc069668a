use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

use text2video::config::Config;
use text2video::context::Backends;
use text2video::jobs::JobRegistry;
use text2video::routes::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("creating output directory {}", config.output_dir.display()))?;
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("creating work directory {}", config.work_dir.display()))?;

    let backends = Backends::from_config(&config);
    tracing::info!("🧩 Backends available: {:?}", backends.generator.available());

    let state = AppState {
        jobs: Arc::new(JobRegistry::new()),
        generator: backends.generator.clone(),
        output_dir: Arc::new(config.output_dir.clone()),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "Starting server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("🛑 Shutdown requested");
        })
        .await
        .context("server error")?;

    backends.shutdown();
    Ok(())
}
