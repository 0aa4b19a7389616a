use std::{path::Path, sync::Arc};

use crate::{
    config::EngineConfig,
    engine::Exchange,
    errors::EngineResult,
    hub::Hub,
    store::{DurableStore, ParityStore},
};

/// Shared handles for the HTTP layer. Built once at startup and cloned into handlers.
#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<Exchange>,
}

impl AppState {
    /// Opens the parity store under `data_dir`, restores state, and wires the exchange.
    pub async fn open(data_dir: impl AsRef<Path>, config: EngineConfig) -> EngineResult<Self> {
        let store: Arc<dyn DurableStore> = Arc::new(ParityStore::open(data_dir)?);
        Self::with_store(store, config).await
    }

    pub async fn with_store(store: Arc<dyn DurableStore>, config: EngineConfig) -> EngineResult<Self> {
        let hub = Arc::new(Hub::new());
        let exchange = Arc::new(Exchange::new(config, store, hub));
        exchange.bootstrap().await?;
        Ok(Self { exchange })
    }
}
