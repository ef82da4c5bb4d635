use std::net::SocketAddr;
use std::sync::Arc;

use pulse::{
    api::{self, AppState},
    config::Config,
    logging, metrics,
    processor::EventProcessor,
    storage::EventStore,
    stream::EventStream,
    warehouse::{default_jobs, EventStoreSource, SourceKind, StreamSource, Warehouse, WarehouseSync},
    PulseError, Result,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize logging; the guard flushes the log file when main returns
    let _log_guard = logging::init_logger("pulse", config.log_format, Some(config.log_file().as_path()))?;

    // Initialize metrics
    metrics::init_metrics();

    let stream = Arc::new(EventStream::new(config.stream_name.clone(), config.stream_max_length));
    let store = EventStore::open(config.event_store_path())?;

    let warehouse = WarehouseSync::new(Warehouse::open(config.warehouse_path())?)
        .with_source(SourceKind::Stream, Arc::new(StreamSource::new(stream.clone())))
        .with_source(SourceKind::Events, Arc::new(EventStoreSource::new(store.clone())));
    for job in default_jobs() {
        warehouse.register_job(job).await?;
    }
    let warehouse = Arc::new(warehouse);

    if config.api_key.is_none() {
        warn!("PULSE_API_KEY is not set, ingest requests will be rejected");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor = EventProcessor::new(
        stream.clone(),
        store.clone(),
        &config.consumer_group,
        &config.consumer,
        config.process_batch_size,
        config.pending_min_idle,
    );
    let processor_task = tokio::spawn(processor.run(config.process_interval, shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(
        warehouse
            .clone()
            .run_scheduler(config.warehouse_sync_interval, shutdown_rx),
    );

    let addr = config.bind_addr();
    let app = api::build_router(AppState::new(config, stream, store, warehouse));

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PulseError::Internal(format!("Failed to bind to address {}: {}", addr, e)))?;
    info!("Starting pulse on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| PulseError::Internal(format!("Server error: {}", e)))?;

    // Stop background loops once the server has drained.
    if shutdown_tx.send(true).is_err() {
        debug!("Background tasks already stopped");
    }
    for (name, task) in [("processor", processor_task), ("scheduler", scheduler_task)] {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    }

    info!("Pulse stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
