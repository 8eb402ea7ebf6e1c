use tokio::select;
use tokio::signal::unix::{self, SignalKind};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{filter::Targets, prelude::*, util::SubscriberInitExt, EnvFilter};

use crate::cli::{arguments, node::Node};
use crate::config::HsyncdConfig;

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let config = HsyncdConfig::from_path(args.config)?;

    let level_filter = config.logger.level;
    let filter = Targets::new()
        .with_target("hsync_engine", level_filter)
        .with_target("hsync_chain", level_filter)
        .with_target("hsync_types", level_filter)
        .with_target("hsyncd", level_filter)
        .with_default(LevelFilter::WARN);

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(env_filter)
        .try_init()?;

    let node = Node::new(config).await?;

    let mut sigterm =
        unix::signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint =
        unix::signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    select! {
        _ = node.cancelled() => {
            info!("engine stopped on its own");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("received SIGINT");
        }
    }

    node.shutdown().await;

    Ok(())
}
