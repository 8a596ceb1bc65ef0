use crate::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A named data stream: items addressed by group and id.
#[async_trait]
pub trait DataStream: Send + Sync {
    async fn get(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace an item, returning the stored value.
    async fn set(&self, group_id: &str, id: &str, data: Value) -> Result<Value, StoreError>;

    async fn delete(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStream {
    groups: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStream for MemoryStream {
    async fn get(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let groups = self.groups.read().await;
        Ok(groups.get(group_id).and_then(|g| g.get(id)).cloned())
    }

    async fn set(&self, group_id: &str, id: &str, data: Value) -> Result<Value, StoreError> {
        self.groups
            .write()
            .await
            .entry(group_id.to_string())
            .or_default()
            .insert(id.to_string(), data.clone());
        Ok(data)
    }

    async fn delete(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let mut groups = self.groups.write().await;
        Ok(groups.get_mut(group_id).and_then(|g| g.remove(id)))
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StoreError> {
        let groups = self.groups.read().await;
        Ok(groups
            .get(group_id)
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// The set of named streams a worker may access.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: BTreeMap<String, Arc<dyn DataStream>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, stream: Arc<dyn DataStream>) {
        let name = name.into();
        tracing::info!("Registering stream: {}", name);
        self.streams.insert(name, stream);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DataStream>> {
        self.streams.get(name)
    }

    /// Stream names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn DataStream>)> {
        self.streams.iter()
    }
}
