//! Sharding control-plane binary: wires a `ShardingService` to etcd and a
//! thin HTTP control API. The HTTP layer itself is a thin external
//! collaborator (spec non-goal); this binary exists only to give the core
//! a runnable process, the way the teacher's own server binary did for
//! its graph API.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use shardctl::{api, config::Config, service::ShardingService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = config.server_address().parse()?;

    let service = std::sync::Arc::new(ShardingService::new(config).await?);
    let app = api::build_router(service);

    info!("shardctl listening on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
