use anyhow::Context;
use hailing_node::{Backends, Node, Services};
use hailing_store::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hailing_node=debug,hailing_dispatch=info,hailing_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("failed to load config")?;
    tracing::info!(
        "Starting hailing node (store: {:?}, bus: {:?})",
        config.database.backend,
        config.bus.backend
    );

    let backends = Backends::connect(&config).await?;
    let node = Node::new(&config, backends, Services::builtin(&config.fare))?;

    // picks up searches interrupted by the previous shutdown
    let resumed = node.app.resume_active_requests(chrono::Utc::now()).await?;
    tracing::info!("Resumed {} active trip requests", resumed);

    let running = node.spawn(CancellationToken::new());

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown signal received");
    running.shutdown().await
}
