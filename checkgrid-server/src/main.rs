use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};

use checkgrid_sync::config::ServerConfig;
use checkgrid_sync::server::{ServerError, SyncServer};
use checkgrid_sync::storage::{BlobStore, MemoryBlobStore, RocksBlobStore, RocksConfig};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ServerError> {
    let config = ServerConfig::from_env()?;
    info!(
        "Starting checkgrid on {} ({} cells, batch_size={}, flush_interval={:?})",
        config.bind_addr, config.vector_size, config.batch_size, config.flush_interval
    );

    let blobs: Arc<dyn BlobStore> = match &config.storage_path {
        Some(path) => Arc::new(RocksBlobStore::open(RocksConfig::at(path.clone()))?),
        None => {
            warn!("CHECKGRID_STORAGE_PATH not set, state will not survive a restart");
            Arc::new(MemoryBlobStore::new())
        }
    };

    let server = Arc::new(SyncServer::start(config, blobs).await?);

    let serving = server.clone();
    let mut serve_task = tokio::spawn(async move { serving.run().await });

    tokio::select! {
        result = &mut serve_task => {
            server.shutdown().await;
            return result.map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for ctrl-c: {e}");
            }
            info!("Interrupt received");
        }
    }

    server.shutdown().await;
    if let Ok(Err(e)) = serve_task.await {
        return Err(e);
    }
    info!("Bye");
    Ok(())
}
