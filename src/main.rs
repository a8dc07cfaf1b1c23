use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use swarmstream::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::parse();
    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("creating {}", config.download_dir.display()))?;

    let engine = WebSeedEngine::new(WebSeedOptions {
        segments: config.segments.max(1),
        retries: config.retries,
        rate_limit: config.rate_limit,
        ..WebSeedOptions::default()
    })?;

    let broadcaster = Arc::new(Broadcaster::new());
    let generator = FfmpegGenerator {
        program: config.ffmpeg.clone(),
        seek: config.preview_seek.clone(),
        width: config.preview_width,
    };
    let previews = PreviewQueue::start(Arc::new(generator), broadcaster.clone());
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(engine),
        config.download_dir.clone(),
        previews,
    ));

    let state = AppState {
        registry: registry.clone(),
        broadcaster: broadcaster.clone(),
        indexer: Arc::new(Indexer::new(
            config.download_dir.clone(),
            &config.ignore_patterns,
        )),
        tokens: Arc::new(TokenStore::new(
            config.credentials(),
            config.api_tokens.iter().cloned(),
        )),
    };

    let shutdown = CancellationToken::new();
    let ticker = tokio::spawn(broadcaster.run(registry, config.tick(), shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;
    info!(addr = %listener.local_addr()?, root = %config.download_dir.display(), "listening");

    let signal = shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    ticker.await?;
    Ok(())
}
