use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{shallow_merge, EntityStore, StoreError};

/// In-memory store for tests and embedded deployments.
///
/// One lock guards all kinds, so bulk deletes and counter bumps are
/// trivially atomic. Listing order is insertion-id order (BTreeMap).
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn field_matches(doc: &Value, field: &str, equals: &str) -> bool {
    doc.get(field).and_then(Value::as_str) == Some(equals)
}

#[async_trait]
impl EntityStore for MemStore {
    async fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.get(kind).and_then(|m| m.get(id)).cloned())
    }

    async fn get_many(&self, kind: &str, ids: &[String]) -> Result<Vec<Option<Value>>, StoreError> {
        let inner = self.inner.lock().await;
        let map = inner.get(kind);
        Ok(ids
            .iter()
            .map(|id| map.and_then(|m| m.get(id)).cloned())
            .collect())
    }

    async fn put(&self, kind: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .entry(kind.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn merge(&self, kind: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
        let mut inner = self.inner.lock().await;
        let doc = inner
            .get_mut(kind)
            .and_then(|m| m.get_mut(id))
            .ok_or_else(|| StoreError::not_found(kind, id))?;
        shallow_merge(doc, &patch);
        Ok(doc.clone())
    }

    async fn increment(
        &self,
        kind: &str,
        id: &str,
        field: &str,
        delta: u64,
    ) -> Result<Value, StoreError> {
        let mut inner = self.inner.lock().await;
        let doc = inner
            .get_mut(kind)
            .and_then(|m| m.get_mut(id))
            .ok_or_else(|| StoreError::not_found(kind, id))?;
        let current = doc.get(field).and_then(Value::as_u64).unwrap_or(0);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert(field.to_string(), Value::from(current + delta));
        }
        Ok(doc.clone())
    }

    async fn append(
        &self,
        kind: &str,
        id: &str,
        field: &str,
        item: Value,
    ) -> Result<Value, StoreError> {
        let mut inner = self.inner.lock().await;
        let doc = inner
            .get_mut(kind)
            .and_then(|m| m.get_mut(id))
            .ok_or_else(|| StoreError::not_found(kind, id))?;
        if let Some(obj) = doc.as_object_mut() {
            match obj.get_mut(field).and_then(Value::as_array_mut) {
                Some(arr) => arr.push(item),
                None => {
                    obj.insert(field.to_string(), Value::Array(vec![item]));
                }
            }
        }
        Ok(doc.clone())
    }

    async fn merge_if_absent(
        &self,
        kind: &str,
        id: &str,
        gate: &str,
        patch: Value,
    ) -> Result<Option<Value>, StoreError> {
        let mut inner = self.inner.lock().await;
        let doc = inner
            .get_mut(kind)
            .and_then(|m| m.get_mut(id))
            .ok_or_else(|| StoreError::not_found(kind, id))?;
        let occupied = doc.get(gate).map(|v| !v.is_null()).unwrap_or(false);
        if occupied {
            return Ok(None);
        }
        shallow_merge(doc, &patch);
        Ok(Some(doc.clone()))
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .get_mut(kind)
            .map(|m| m.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn delete_where(
        &self,
        kind: &str,
        field: &str,
        equals: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(map) = inner.get_mut(kind) else {
            return Ok(0);
        };
        let before = map.len();
        map.retain(|_, doc| !field_matches(doc, field, equals));
        Ok((before - map.len()) as u64)
    }

    async fn list(&self, kind: &str) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_where(
        &self,
        kind: &str,
        field: &str,
        equals: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(kind)
            .map(|m| {
                m.values()
                    .filter(|doc| field_matches(doc, field, equals))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
