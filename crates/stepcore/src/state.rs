use crate::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Trace-scoped key/value state shared by the steps of one trace.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, trace_id: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, trace_id: &str, key: &str, value: Value) -> Result<Value, StoreError>;

    /// Remove `key` and return the value it held.
    async fn delete(&self, trace_id: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Remove every key of `trace_id`.
    async fn clear(&self, trace_id: &str) -> Result<(), StoreError>;

    /// All values stored under `trace_id`, ordered by key.
    async fn get_group(&self, trace_id: &str) -> Result<Vec<Value>, StoreError>;
}

/// In-process state store.
#[derive(Default)]
pub struct MemoryStateStore {
    traces: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, trace_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let traces = self.traces.read().await;
        Ok(traces.get(trace_id).and_then(|t| t.get(key)).cloned())
    }

    async fn set(&self, trace_id: &str, key: &str, value: Value) -> Result<Value, StoreError> {
        let mut traces = self.traces.write().await;
        traces
            .entry(trace_id.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    async fn delete(&self, trace_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let mut traces = self.traces.write().await;
        let Some(entries) = traces.get_mut(trace_id) else {
            return Ok(None);
        };
        let removed = entries.remove(key);
        if entries.is_empty() {
            traces.remove(trace_id);
        }
        Ok(removed)
    }

    async fn clear(&self, trace_id: &str) -> Result<(), StoreError> {
        self.traces.write().await.remove(trace_id);
        Ok(())
    }

    async fn get_group(&self, trace_id: &str) -> Result<Vec<Value>, StoreError> {
        let traces = self.traces.read().await;
        let Some(entries) = traces.get(trace_id) else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        Ok(keys.into_iter().map(|k| entries[k].clone()).collect())
    }
}
