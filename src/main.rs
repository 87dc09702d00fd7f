//! photobooth - HTTP Server Entry Point
//!
//! Starts the HTTP server and the task trigger.

use photobooth::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "photobooth=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        model = %config.transform.model,
        size = %config.transform.size,
        task_store = config.task_store.as_str(),
        data_dir = %config.data_dir.display(),
        dev_mode = config.dev_mode,
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
