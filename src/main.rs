//! Admission controller binary.
//!
//! Wires the in-memory object store, cache, queue manager, reconcilers and
//! the scheduler loop, then runs until interrupted.

use std::sync::Arc;

use tracing::info;

use gatehouse::{
    Cache, Controller, ControllerConfig, InMemoryStore, MetricsRegistry, QueueManager, Scheduler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ControllerConfig::from_env()?;
    info!(?config, "starting admission controller");

    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(Cache::new());
    let queues = Arc::new(QueueManager::new());
    let metrics = MetricsRegistry::new()?;

    let controller = Controller::new(
        store.clone(),
        cache.clone(),
        queues.clone(),
        metrics.clone(),
        config.clone(),
    );
    let mut handles = controller.start().await?;

    let scheduler = Scheduler::new(store, cache, queues, metrics, config);
    handles.push(tokio::spawn(scheduler.run()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
