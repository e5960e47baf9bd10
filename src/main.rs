use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};

use proxy_agent::config::Config;
use proxy_agent::conn::Connection;
use proxy_agent::socket::SocketTable;
use proxy_agent::watched_tasks::WatchedTasksBuilder;

async fn init() -> Result<(Arc<SocketTable>, WatchedTasksBuilder)> {
    let mut wtb = WatchedTasksBuilder::new();

    let config = Config::from_env().context("failed to read agent configuration")?;
    info!(
        "connecting to {}:{} as '{}'",
        config.broker_host, config.broker_port, config.client_id
    );

    let connection = Connection::new(config, None);
    connection.connect();

    let sockets = Arc::new(SocketTable::new(connection.clone()));

    // Keep the process alive for as long as the connection manager's own
    // scheduler task (spawned inside `Connection::new`) runs; there is
    // nothing else in this crate that blocks `main` on its own, so this
    // watched task exists purely to give `WatchedTasks` something to await.
    wtb.spawn_task("connection-idle", async move {
        std::future::pending::<()>().await;
        Ok(())
    })?;

    Ok((sockets, wtb))
}

#[async_std::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    match init().await {
        Ok((_sockets, mut wtb)) => {
            info!("setup complete, handling requests");
            wtb.watch().await
        }
        Err(e) => {
            error!("failed to initialize proxy-agentd: {e:#}");
            Err(e)
        }
    }
}
