//! ringkv-node: entry point for a replicated KV node.
//!
//! Loads config, opens the storage engine, wires the router, coordinator
//! and HTTP replica client, then serves the entity API on the configured
//! listen address until Ctrl+C.

use ringkv_kv::{Coordinator, Router};
use ringkv_net::HttpReplicaClient;
use ringkv_storage::StorageEngine;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ringkv_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = ringkv_config::load_from_file(std::path::Path::new(&config_path))
        .map_err(|e| format!("failed to load config from {}: {}", config_path, e))?;

    let local_id = config.local_id();
    let coordinator_config = config.coordinator_config();
    tracing::info!(
        "node {} in a {}-node cluster, {}",
        local_id,
        config.topology.len(),
        coordinator_config.replication
    );

    // Open storage engine and start background compaction
    let storage = Arc::new(StorageEngine::open(
        &config.storage.data_dir,
        config.storage.engine_options(),
    )?);
    let compaction = ringkv_storage::spawn_compaction_task(
        storage.clone(),
        config.storage.compaction_interval(),
        config.storage.compaction_trigger_segments,
    );

    // Create router, replica client and coordinator
    let router = Arc::new(Router::new(config.topology.clone(), config.virtual_nodes)?);
    let replica_client = Arc::new(HttpReplicaClient::new(
        coordinator_config.replica_timeout,
    )?);
    let coordinator = Arc::new(Coordinator::new(
        local_id,
        router,
        storage.clone(),
        replica_client,
        coordinator_config,
    )?);

    let app = ringkv_net::build_server(coordinator);

    // Serve with graceful shutdown on Ctrl+C
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!("serving HTTP on {}", config.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("received Ctrl+C, shutting down");
        })
        .await?;

    // Flush the memtable before exiting
    compaction.abort();
    storage.close()?;
    tracing::info!("storage closed");

    Ok(())
}
