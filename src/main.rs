use std::sync::Arc;

use karte::app;
use karte::config::KarteConfig;
use karte::saving::FileStore;
use karte::store::{MemoryStore, RecordStore};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = KarteConfig::load()?;

    // Keep records in memory unless a snapshot file is configured
    let store: Arc<dyn RecordStore> = match &config.store.data_file {
        Some(path) => {
            info!("persisting karte records to {}", path.display());
            Arc::new(FileStore::open(config.store.collection.clone(), path)?)
        }
        None => Arc::new(MemoryStore::new(config.store.collection.clone())),
    };

    app::run(store, config).await?;

    Ok(())
}
