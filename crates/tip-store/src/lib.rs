//! Entity store seam for the control plane.
//!
//! Entities are flat JSON documents keyed by `(kind, id)`. The trait keeps
//! the primitives the control plane leans on — shallow merge patches,
//! atomic counter increments, write-once fields, all-or-nothing bulk
//! deletes — so a backing store can map each one onto its own native
//! operation instead of read-modify-write races.

use async_trait::async_trait;
use serde_json::Value;

mod mem;
mod sqlite;

pub use mem::MemStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },
    #[error("store backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Shallow merge: top-level keys of `patch` replace those of `doc`
/// wholesale (nested objects are not merged recursively); a `null` patch
/// value removes the key. Both backends route through this one function
/// so their merge semantics cannot drift apart.
pub(crate) fn shallow_merge(doc: &mut Value, patch: &Value) {
    if let (Some(obj), Some(patch_obj)) = (doc.as_object_mut(), patch.as_object()) {
        for (k, v) in patch_obj {
            if v.is_null() {
                obj.remove(k);
            } else {
                obj.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Document store keyed by `(kind, id)`.
///
/// `merge` applies a shallow JSON merge patch (top-level keys replace,
/// `null` removes). `increment` and `merge_if_absent` must be atomic with
/// respect to concurrent calls for the same id. `delete_where` removes
/// every match or nothing.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Load several ids at once; result is positionally aligned with `ids`.
    async fn get_many(&self, kind: &str, ids: &[String]) -> Result<Vec<Option<Value>>, StoreError>;

    /// Create or replace the full document.
    async fn put(&self, kind: &str, id: &str, doc: Value) -> Result<(), StoreError>;

    /// Shallow-merge `patch` (a JSON object) into the document; returns the
    /// updated document. `NotFound` if the id is absent.
    async fn merge(&self, kind: &str, id: &str, patch: Value) -> Result<Value, StoreError>;

    /// Atomically add `delta` to a numeric field (missing counts as 0);
    /// returns the updated document.
    async fn increment(
        &self,
        kind: &str,
        id: &str,
        field: &str,
        delta: u64,
    ) -> Result<Value, StoreError>;

    /// Append `item` to an array field (missing counts as empty); returns
    /// the updated document.
    async fn append(&self, kind: &str, id: &str, field: &str, item: Value)
        -> Result<Value, StoreError>;

    /// Apply a shallow merge patch only if `gate` is currently absent or
    /// null, as one atomic mutation. Returns `Some(updated)` when the
    /// patch landed, `None` when the gate field was already occupied.
    /// Backs write-once transitions whose companion fields must land with
    /// the gate or not at all.
    async fn merge_if_absent(
        &self,
        kind: &str,
        id: &str,
        gate: &str,
        patch: Value,
    ) -> Result<Option<Value>, StoreError>;

    /// Returns true when a document was removed.
    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError>;

    /// Delete every document of `kind` whose top-level `field` equals
    /// `equals`; all-or-nothing. Returns the number removed.
    async fn delete_where(&self, kind: &str, field: &str, equals: &str)
        -> Result<u64, StoreError>;

    async fn list(&self, kind: &str) -> Result<Vec<Value>, StoreError>;

    async fn list_where(&self, kind: &str, field: &str, equals: &str)
        -> Result<Vec<Value>, StoreError>;
}
