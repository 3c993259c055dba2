use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ConfigKey, ConfigPayload};
use crate::error::RenderError;

/// Storage for rendered payloads.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Insert or overwrite the payload under its key.
    async fn put(&self, payload: ConfigPayload) -> Result<(), RenderError>;

    async fn get(&self, key: &ConfigKey) -> Option<ConfigPayload>;

    async fn list(&self) -> Vec<ConfigPayload>;

    async fn remove(&self, key: &ConfigKey) -> bool;
}

/// Process-local [`ConfigStore`]. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    payloads: RwLock<HashMap<ConfigKey, ConfigPayload>>,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn put(&self, payload: ConfigPayload) -> Result<(), RenderError> {
        self.payloads.write().await.insert(payload.key, payload);
        Ok(())
    }

    async fn get(&self, key: &ConfigKey) -> Option<ConfigPayload> {
        self.payloads.read().await.get(key).cloned()
    }

    async fn list(&self) -> Vec<ConfigPayload> {
        self.payloads.read().await.values().cloned().collect()
    }

    async fn remove(&self, key: &ConfigKey) -> bool {
        self.payloads.write().await.remove(key).is_some()
    }
}
