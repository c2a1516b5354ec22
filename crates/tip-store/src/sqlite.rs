use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use crate::{shallow_merge, EntityStore, StoreError};

/// Single-node sqlite adapter: one flat `entities(kind, id, doc)` table,
/// connection per call, WAL journal. Counter increments and write-once
/// fields compile to single json1 UPDATE statements so they are atomic
/// without application-level locking.
#[derive(Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let db_path = dir.join("entities.sqlite");
        let need_init = !db_path.exists();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let busy_ms: u64 = std::env::var("TIP_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        if need_init {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS entities (
                  kind TEXT NOT NULL,
                  id TEXT NOT NULL,
                  doc TEXT NOT NULL,
                  PRIMARY KEY (kind, id)
                );
                CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);
                "#,
            )?;
        }
        Ok(Self { db_path })
    }

    fn conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(conn)
    }

    fn fetch_doc(conn: &Connection, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM entities WHERE kind=?1 AND id=?2",
                params![kind, id],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| StoreError::Backend(e.to_string())),
            None => Ok(None),
        }
    }

    fn require_doc(conn: &Connection, kind: &str, id: &str) -> Result<Value, StoreError> {
        Self::fetch_doc(conn, kind, id)?.ok_or_else(|| StoreError::not_found(kind, id))
    }
}

fn json_path(field: &str) -> String {
    format!("$.{field}")
}

fn to_text(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn()?;
        Self::fetch_doc(&conn, kind, id)
    }

    async fn get_many(&self, kind: &str, ids: &[String]) -> Result<Vec<Option<Value>>, StoreError> {
        let conn = self.conn()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(Self::fetch_doc(&conn, kind, id)?);
        }
        Ok(out)
    }

    async fn put(&self, kind: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO entities(kind, id, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind, id) DO UPDATE SET doc=excluded.doc",
            params![kind, id, to_text(&doc)?],
        )?;
        Ok(())
    }

    async fn merge(&self, kind: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
        // Read-merge-write under an immediate transaction so the shallow
        // semantics match MemStore exactly (sqlite's json_patch would
        // deep-merge nested objects instead of replacing them).
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut doc = Self::require_doc(&tx, kind, id)?;
        shallow_merge(&mut doc, &patch);
        tx.execute(
            "UPDATE entities SET doc = ?3 WHERE kind=?1 AND id=?2",
            params![kind, id, to_text(&doc)?],
        )?;
        tx.commit()?;
        Ok(doc)
    }

    async fn increment(
        &self,
        kind: &str,
        id: &str,
        field: &str,
        delta: u64,
    ) -> Result<Value, StoreError> {
        let conn = self.conn()?;
        let path = json_path(field);
        let changed = conn.execute(
            "UPDATE entities
             SET doc = json_set(doc, ?3, COALESCE(json_extract(doc, ?3), 0) + ?4)
             WHERE kind=?1 AND id=?2",
            params![kind, id, path, delta as i64],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(kind, id));
        }
        Self::require_doc(&conn, kind, id)
    }

    async fn append(
        &self,
        kind: &str,
        id: &str,
        field: &str,
        item: Value,
    ) -> Result<Value, StoreError> {
        let conn = self.conn()?;
        let path = json_path(field);
        let changed = conn.execute(
            "UPDATE entities
             SET doc = json_set(
               doc, ?3,
               json_insert(COALESCE(json_extract(doc, ?3), json_array()), '$[#]', json(?4)))
             WHERE kind=?1 AND id=?2",
            params![kind, id, path, to_text(&item)?],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(kind, id));
        }
        Self::require_doc(&conn, kind, id)
    }

    async fn merge_if_absent(
        &self,
        kind: &str,
        id: &str,
        gate: &str,
        patch: Value,
    ) -> Result<Option<Value>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut doc = Self::require_doc(&tx, kind, id)?;
        let occupied = doc.get(gate).map(|v| !v.is_null()).unwrap_or(false);
        if occupied {
            return Ok(None);
        }
        shallow_merge(&mut doc, &patch);
        tx.execute(
            "UPDATE entities SET doc = ?3 WHERE kind=?1 AND id=?2",
            params![kind, id, to_text(&doc)?],
        )?;
        tx.commit()?;
        Ok(Some(doc))
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM entities WHERE kind=?1 AND id=?2",
            params![kind, id],
        )?;
        Ok(changed > 0)
    }

    async fn delete_where(
        &self,
        kind: &str,
        field: &str,
        equals: &str,
    ) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let path = json_path(field);
        let changed = conn.execute(
            "DELETE FROM entities WHERE kind=?1 AND json_extract(doc, ?2) = ?3",
            params![kind, path, equals],
        )?;
        Ok(changed as u64)
    }

    async fn list(&self, kind: &str) -> Result<Vec<Value>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT doc FROM entities WHERE kind=?1 ORDER BY id ASC")?;
        let mut rows = stmt.query(params![kind])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let s: String = row.get(0)?;
            out.push(serde_json::from_str(&s).map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(out)
    }

    async fn list_where(
        &self,
        kind: &str,
        field: &str,
        equals: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let conn = self.conn()?;
        let path = json_path(field);
        let mut stmt = conn.prepare(
            "SELECT doc FROM entities WHERE kind=?1 AND json_extract(doc, ?2) = ?3 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![kind, path, equals])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let s: String = row.get(0)?;
            out.push(serde_json::from_str(&s).map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(out)
    }
}
