//! Standalone server binary.
//!
//! Serves the offline capability registry by default; embedders wanting
//! live providers build their own binary around [`scribe_server::serve`]
//! with a populated registry.

use scribe_core::scripted::offline_registry;
use scribe_core::RunManager;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_dir =
        std::env::var("SCRIBE_DATA_DIR").unwrap_or_else(|_| "./scribe-data".to_string());
    let addr = std::env::var("SCRIBE_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let manager = Arc::new(RunManager::new(data_dir, offline_registry())?);
    scribe_server::serve(manager, &addr).await
}
