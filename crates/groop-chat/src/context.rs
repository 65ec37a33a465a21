//! Explicit wiring of the chat core for one signed-in account.
//!
//! Everything a session needs hangs off a [`ChatContext`]; there is no
//! process-global state, so tests and multi-account embeddings simply build
//! more than one.

use std::sync::Arc;

use crate::backend::RemoteStore;
use crate::config::ChatConfig;
use crate::error::KeyError;
use crate::key_exchange::KeyExchangeCoordinator;
use crate::key_manager::KeyManager;
use crate::sync::MessageSyncEngine;

pub struct ChatContext {
    pub config: ChatConfig,
    pub store: Arc<dyn RemoteStore>,
    pub keys: Arc<KeyManager>,
    pub key_exchange: KeyExchangeCoordinator,
    pub sync: MessageSyncEngine,
}

impl ChatContext {
    pub fn new(config: ChatConfig, store: Arc<dyn RemoteStore>, keys: Arc<KeyManager>) -> Arc<Self> {
        let key_exchange = KeyExchangeCoordinator::new(store.clone(), keys.clone());
        let sync = MessageSyncEngine::new(store.clone(), keys.clone(), config.page_size);
        Arc::new(Self {
            config,
            store,
            keys,
            key_exchange,
            sync,
        })
    }

    /// Open the configured key database and wire everything to `store`.
    pub fn open(config: ChatConfig, store: Arc<dyn RemoteStore>) -> Result<Arc<Self>, KeyError> {
        let keys = Arc::new(KeyManager::open(&config)?);
        Ok(Self::new(config, store, keys))
    }
}
