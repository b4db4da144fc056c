// Broker service main entry point.
use anyhow::Result;
use broker::{app, config, observability};
use ferry_storage::MemoryStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability("ferry-broker")?;
    let config = config::ServiceConfig::from_env_or_yaml()?;
    // In-process store; queues and blobs live only as long as the process.
    let store = Arc::new(MemoryStore::new());
    let report = app::run_with_shutdown(config, store, metrics_handle, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    tracing::info!(clean = report.is_clean(), "broker stopped");
    Ok(())
}
