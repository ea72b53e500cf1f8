//! Owner of a broker's store handle.
//!
//! The manager opens the [`Store`] lazily on first use and tears it down on
//! [`release_store`](StoreManager::release_store); a later
//! [`get_store`](StoreManager::get_store) opens a fresh one.

use std::sync::{Arc, Mutex};
use tracing::info;

use super::config::StoreConfig;
use super::database::StoreDatabase;
use super::store::Store;
use super::sync::lock;
use crate::error::StoreResult;

#[derive(Debug)]
pub struct StoreManager {
    config: StoreConfig,
    db: Arc<StoreDatabase>,
    store: Mutex<Option<Arc<Store>>>,
}

impl StoreManager {
    /// Validate `config` and open the database it describes.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        config.check()?;
        let db = Arc::new(StoreDatabase::open(&config)?);
        Ok(Self::with_database(config, db))
    }

    /// Manage a store over an existing database, for brokers sharing one.
    pub fn with_database(config: StoreConfig, db: Arc<StoreDatabase>) -> Self {
        Self {
            config,
            db,
            store: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<StoreDatabase> {
        &self.db
    }

    /// The open store, opening it if needed.
    pub fn get_store(&self) -> StoreResult<Arc<Store>> {
        let mut slot = lock(&self.store);
        if let Some(store) = slot.as_ref() {
            if !store.is_closed() {
                return Ok(store.clone());
            }
        }
        let store = Arc::new(Store::open(self.config.clone(), self.db.clone())?);
        info!(broker_id = %self.config.broker_id, "Store opened");
        *slot = Some(store.clone());
        Ok(store)
    }

    /// Close the store if it is open. Clones handed out earlier see
    /// `Closed` from then on.
    pub fn release_store(&self, cleanup: bool) -> StoreResult<()> {
        let store = lock(&self.store).take();
        match store {
            Some(store) => store.close(cleanup),
            None => Ok(()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.store)
            .as_ref()
            .is_some_and(|store| !store.is_closed())
    }
}
