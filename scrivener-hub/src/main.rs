//! Scrivener Hub: standalone synchronization server.
//!
//! Configured from `SCRIVENER_*` environment variables (see
//! [`HubConfig::from_env`]). Logging follows `RUST_LOG`, `info` by default.
//! Ctrl-C stops accepting connections and flushes every open document
//! before exiting.

use std::sync::Arc;

use log::info;
use scrivener_collab::{HubConfig, SyncHub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = HubConfig::from_env()?;
    info!(
        "Starting hub on {} (storage: {:?}, save debounce: {:?})",
        config.bind_addr, config.storage, config.save_debounce
    );

    let hub = Arc::new(SyncHub::new(config)?);
    let mut serving = tokio::spawn({
        let hub = hub.clone();
        async move { hub.run().await }
    });

    tokio::select! {
        result = &mut serving => {
            // Only reached if the listener could not be set up.
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupt received, flushing documents");
        }
    }

    hub.shutdown().await?;
    serving.await??;
    info!("Hub stopped");
    Ok(())
}
