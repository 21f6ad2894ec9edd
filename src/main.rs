use std::sync::Arc;

use alert_notifier::{
    clients::{
        fan::FanClient,
        graph::RedisAncestorGraph,
        redis::RedisClient,
        traits::{AncestorGraph, Database, SaturationService},
    },
    config::Config,
    supervisor::{Supervisor, shutdown_signal},
};
use anyhow::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;

    let redis = RedisClient::connect(&config).await?;
    let graph: Arc<dyn AncestorGraph> = Arc::new(RedisAncestorGraph::new(redis.connection()));
    let database: Arc<dyn Database> = Arc::new(redis);

    let saturation: Option<Arc<dyn SaturationService>> = if config.fan_enabled() {
        Some(Arc::new(FanClient::new(&config)?))
    } else {
        info!("Fan url is not configured, saturation falls back to defaults");
        None
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    Supervisor::new(config, database, graph, saturation)
        .run(shutdown)
        .await
}
