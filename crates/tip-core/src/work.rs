use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tip_events::Bus;
use tip_store::EntityStore;
use uuid::Uuid;

use crate::connector::Connector;
use crate::error::ControlError;
use crate::loader::BatchFetch;
use crate::principal::Principal;
use crate::{parse_doc, store_call, KIND_CONNECTOR, KIND_WORK};

/// One tracked unit of asynchronous connector effort.
///
/// Counters are monotone: `expected_number` grows as sub-tasks are
/// discovered, `completed_number` grows once per reported outcome whether
/// or not it carried an error. `processed_at` is write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub id: String,
    pub connector_id: String,
    pub user_id: String,
    pub friendly_name: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub in_error: bool,
    #[serde(default)]
    pub expected_number: u64,
    #[serde(default)]
    pub completed_number: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateWorkOptions {
    pub received_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct WorkTracker {
    store: Arc<dyn EntityStore>,
    bus: Bus,
    store_timeout: Duration,
}

impl WorkTracker {
    pub fn new(store: Arc<dyn EntityStore>, bus: Bus, store_timeout: Duration) -> Self {
        Self {
            store,
            bus,
            store_timeout,
        }
    }

    pub async fn create_work(
        &self,
        principal: &Principal,
        connector: &Connector,
        friendly_name: &str,
        owner_user_id: &str,
        opts: CreateWorkOptions,
    ) -> Result<Work, ControlError> {
        let work = Work {
            id: format!("work--{}", Uuid::new_v4()),
            connector_id: connector.id.clone(),
            user_id: owner_user_id.to_string(),
            friendly_name: friendly_name.to_string(),
            received_at: opts.received_time.unwrap_or_else(Utc::now),
            processed_at: None,
            in_error: false,
            expected_number: 0,
            completed_number: 0,
            errors: Vec::new(),
            messages: Vec::new(),
        };
        let doc = serde_json::to_value(&work)
            .map_err(|e| ControlError::Internal(format!("serialize work: {e}")))?;
        store_call(self.store_timeout, self.store.put(KIND_WORK, &work.id, doc)).await?;
        tracing::debug!(work = %work.id, connector = %connector.id, "work created");
        self.bus
            .publish(tip_topics::TOPIC_WORK_CREATED, &principal.id, &work);
        Ok(work)
    }

    /// `expected_number += count`. Rejected before any mutation when the
    /// count is negative; overshoot relative to eventual completions is a
    /// caller bug that only ever shows up as a never-complete status.
    pub async fn add_expectations(
        &self,
        principal: &Principal,
        work_id: &str,
        count: i64,
    ) -> Result<Work, ControlError> {
        if count < 0 {
            return Err(ControlError::Validation(format!(
                "expectation count must be non-negative, got {count}"
            )));
        }
        let doc = store_call(
            self.store_timeout,
            self.store
                .increment(KIND_WORK, work_id, "expected_number", count as u64),
        )
        .await?;
        let work: Work = parse_doc(doc)?;
        self.bus
            .publish(tip_topics::TOPIC_WORK_EXPECTATIONS_ADDED, &principal.id, &work);
        Ok(work)
    }

    /// Accounts one completed sub-task. An error on one expectation never
    /// aborts its siblings; the work item only fails through the terminal
    /// `update_processed_time(.., in_error = true)` call.
    pub async fn report_expectation(
        &self,
        principal: &Principal,
        work_id: &str,
        error: Option<&str>,
    ) -> Result<Work, ControlError> {
        let mut doc = store_call(
            self.store_timeout,
            self.store.increment(KIND_WORK, work_id, "completed_number", 1),
        )
        .await?;
        if let Some(msg) = error {
            doc = store_call(
                self.store_timeout,
                self.store.append(KIND_WORK, work_id, "errors", json!(msg)),
            )
            .await?;
        }
        let work: Work = parse_doc(doc)?;
        self.bus.publish(
            tip_topics::TOPIC_WORK_EXPECTATION_REPORTED,
            &principal.id,
            &work,
        );
        Ok(work)
    }

    /// Liveness refresh during long-running work; terminal fields untouched.
    pub async fn update_received_time(
        &self,
        principal: &Principal,
        work_id: &str,
        message: Option<&str>,
    ) -> Result<Work, ControlError> {
        let mut doc = store_call(
            self.store_timeout,
            self.store
                .merge(KIND_WORK, work_id, json!({"received_at": Utc::now()})),
        )
        .await?;
        if let Some(msg) = message.filter(|m| !m.trim().is_empty()) {
            doc = store_call(
                self.store_timeout,
                self.store.append(KIND_WORK, work_id, "messages", json!(msg)),
            )
            .await?;
        }
        let work: Work = parse_doc(doc)?;
        self.bus
            .publish(tip_topics::TOPIC_WORK_RECEIVED, &principal.id, &work);
        Ok(work)
    }

    /// Terminal transition, exactly-once: a second call is a `Conflict`
    /// and leaves the original `processed_at` untouched. The timestamp,
    /// `in_error` and the closing message land in one atomic gated patch,
    /// so a failed call leaves the work untouched and retryable.
    pub async fn update_processed_time(
        &self,
        principal: &Principal,
        work_id: &str,
        message: Option<&str>,
        in_error: bool,
    ) -> Result<Work, ControlError> {
        let doc = store_call(self.store_timeout, self.store.get(KIND_WORK, work_id))
            .await?
            .ok_or_else(|| ControlError::NotFound {
                kind: KIND_WORK.into(),
                id: work_id.into(),
            })?;
        let current: Work = parse_doc(doc)?;
        let mut patch = json!({
            "processed_at": Utc::now(),
            "in_error": in_error,
        });
        if let Some(msg) = message.filter(|m| !m.trim().is_empty()) {
            let mut messages = current.messages;
            messages.push(msg.to_string());
            patch["messages"] = json!(messages);
        }
        let updated = store_call(
            self.store_timeout,
            self.store
                .merge_if_absent(KIND_WORK, work_id, "processed_at", patch),
        )
        .await?;
        let Some(doc) = updated else {
            return Err(ControlError::Conflict(format!(
                "work {work_id} already processed"
            )));
        };
        let work: Work = parse_doc(doc)?;
        tracing::debug!(work = %work_id, in_error, "work processed");
        self.bus
            .publish(tip_topics::TOPIC_WORK_PROCESSED, &principal.id, &work);
        Ok(work)
    }

    /// Liveness poll from operators. Deliberately mutating: it refreshes
    /// `received_at` exactly like `update_received_time`, so stalled
    /// workers stand out by a stale timestamp.
    pub async fn ping_work(
        &self,
        principal: &Principal,
        work_id: &str,
    ) -> Result<Work, ControlError> {
        self.update_received_time(principal, work_id, None).await
    }

    pub async fn delete_work(
        &self,
        principal: &Principal,
        work_id: &str,
    ) -> Result<(), ControlError> {
        let doc = store_call(self.store_timeout, self.store.get(KIND_WORK, work_id))
            .await?
            .ok_or_else(|| ControlError::NotFound {
                kind: KIND_WORK.into(),
                id: work_id.into(),
            })?;
        let work: Work = parse_doc(doc)?;
        store_call(self.store_timeout, self.store.delete(KIND_WORK, work_id)).await?;
        self.bus
            .publish(tip_topics::TOPIC_WORK_DELETED, &principal.id, &work);
        Ok(())
    }

    /// Bulk delete backing the connector-delete cascade; all-or-nothing at
    /// the store layer, so readers never observe a partial cascade.
    pub async fn delete_work_for_connector(
        &self,
        principal: &Principal,
        connector_id: &str,
    ) -> Result<u64, ControlError> {
        let removed = store_call(
            self.store_timeout,
            self.store.delete_where(KIND_WORK, "connector_id", connector_id),
        )
        .await?;
        if removed > 0 {
            tracing::debug!(connector = %connector_id, removed, "work cascade deleted");
            self.bus.publish(
                tip_topics::TOPIC_WORK_DELETED,
                &principal.id,
                &json!({"connector_id": connector_id, "removed": removed}),
            );
        }
        Ok(removed)
    }

    pub async fn find_by_id(
        &self,
        _principal: &Principal,
        work_id: &str,
    ) -> Result<Option<Work>, ControlError> {
        let doc = store_call(self.store_timeout, self.store.get(KIND_WORK, work_id)).await?;
        doc.map(parse_doc).transpose()
    }

    pub async fn works_for_connector(
        &self,
        _principal: &Principal,
        connector_id: &str,
    ) -> Result<Vec<Work>, ControlError> {
        let docs = store_call(
            self.store_timeout,
            self.store.list_where(KIND_WORK, "connector_id", connector_id),
        )
        .await?;
        docs.into_iter().map(parse_doc).collect()
    }
}

/// Batch fetch of Work-by-connector: one listing query serves every
/// connector key requested within the request scope.
pub struct WorksForConnectorFetch {
    store: Arc<dyn EntityStore>,
    store_timeout: Duration,
}

impl WorksForConnectorFetch {
    pub fn new(store: Arc<dyn EntityStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }
}

#[async_trait]
impl BatchFetch for WorksForConnectorFetch {
    type Key = String;
    type Value = Vec<Work>;

    async fn fetch_many(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<Work>>, ControlError> {
        let docs = store_call(self.store_timeout, self.store.list(KIND_WORK)).await?;
        let mut out: HashMap<String, Vec<Work>> =
            keys.iter().map(|k| (k.clone(), Vec::new())).collect();
        for doc in docs {
            let work: Work = parse_doc(doc)?;
            if let Some(bucket) = out.get_mut(&work.connector_id) {
                bucket.push(work);
            }
        }
        Ok(out)
    }
}

/// Batch fetch of Connector-by-work: one `get_many` per entity kind.
pub struct ConnectorForWorkFetch {
    store: Arc<dyn EntityStore>,
    store_timeout: Duration,
}

impl ConnectorForWorkFetch {
    pub fn new(store: Arc<dyn EntityStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }
}

#[async_trait]
impl BatchFetch for ConnectorForWorkFetch {
    type Key = String;
    type Value = Connector;

    async fn fetch_many(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Connector>, ControlError> {
        let work_docs =
            store_call(self.store_timeout, self.store.get_many(KIND_WORK, keys)).await?;
        let mut connector_ids: Vec<String> = Vec::new();
        let mut work_to_connector: HashMap<String, String> = HashMap::new();
        for doc in work_docs.into_iter().flatten() {
            let work: Work = parse_doc(doc)?;
            if !connector_ids.contains(&work.connector_id) {
                connector_ids.push(work.connector_id.clone());
            }
            work_to_connector.insert(work.id, work.connector_id);
        }
        let connector_docs = store_call(
            self.store_timeout,
            self.store.get_many(KIND_CONNECTOR, &connector_ids),
        )
        .await?;
        let mut connectors: HashMap<String, Connector> = HashMap::new();
        for doc in connector_docs.into_iter().flatten() {
            let connector: Connector = parse_doc(doc)?;
            connectors.insert(connector.id.clone(), connector);
        }
        let mut out = HashMap::new();
        for (work_id, connector_id) in work_to_connector {
            if let Some(connector) = connectors.get(&connector_id) {
                out.insert(work_id, connector.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Capability, Connector};
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tip_store::{MemStore, StoreError};
    use tokio::sync::broadcast::error::TryRecvError;

    /// MemStore wrapper with failure knobs for exercising the tracker's
    /// behavior when the backing store misbehaves.
    struct RiggedStore {
        inner: MemStore,
        fail_next_gated_merge: AtomicBool,
        stall_list: bool,
    }

    impl RiggedStore {
        fn new() -> Self {
            Self {
                inner: MemStore::new(),
                fail_next_gated_merge: AtomicBool::new(false),
                stall_list: false,
            }
        }
    }

    #[async_trait]
    impl EntityStore for RiggedStore {
        async fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(kind, id).await
        }

        async fn get_many(
            &self,
            kind: &str,
            ids: &[String],
        ) -> Result<Vec<Option<Value>>, StoreError> {
            self.inner.get_many(kind, ids).await
        }

        async fn put(&self, kind: &str, id: &str, doc: Value) -> Result<(), StoreError> {
            self.inner.put(kind, id, doc).await
        }

        async fn merge(&self, kind: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
            self.inner.merge(kind, id, patch).await
        }

        async fn increment(
            &self,
            kind: &str,
            id: &str,
            field: &str,
            delta: u64,
        ) -> Result<Value, StoreError> {
            self.inner.increment(kind, id, field, delta).await
        }

        async fn append(
            &self,
            kind: &str,
            id: &str,
            field: &str,
            item: Value,
        ) -> Result<Value, StoreError> {
            self.inner.append(kind, id, field, item).await
        }

        async fn merge_if_absent(
            &self,
            kind: &str,
            id: &str,
            gate: &str,
            patch: Value,
        ) -> Result<Option<Value>, StoreError> {
            if self.fail_next_gated_merge.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("simulated outage".into()));
            }
            self.inner.merge_if_absent(kind, id, gate, patch).await
        }

        async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.delete(kind, id).await
        }

        async fn delete_where(
            &self,
            kind: &str,
            field: &str,
            equals: &str,
        ) -> Result<u64, StoreError> {
            self.inner.delete_where(kind, field, equals).await
        }

        async fn list(&self, kind: &str) -> Result<Vec<Value>, StoreError> {
            if self.stall_list {
                std::future::pending::<()>().await;
            }
            self.inner.list(kind).await
        }

        async fn list_where(
            &self,
            kind: &str,
            field: &str,
            equals: &str,
        ) -> Result<Vec<Value>, StoreError> {
            self.inner.list_where(kind, field, equals).await
        }
    }

    fn tracker() -> WorkTracker {
        WorkTracker::new(
            Arc::new(MemStore::new()),
            Bus::new(16),
            Duration::from_secs(5),
        )
    }

    fn connector(id: &str) -> Connector {
        Connector {
            id: id.to_string(),
            name: id.to_string(),
            capabilities: [Capability::Import].into_iter().collect(),
            active: true,
            connector_state: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn completed_counts_every_report_with_or_without_error() {
        let tracker = tracker();
        let p = Principal::system();
        let w = tracker
            .create_work(&p, &connector("c1"), "job-1", "u1", CreateWorkOptions::default())
            .await
            .expect("create");
        tracker.report_expectation(&p, &w.id, None).await.expect("report");
        tracker
            .report_expectation(&p, &w.id, Some("page 2 failed"))
            .await
            .expect("report");
        let w = tracker.report_expectation(&p, &w.id, None).await.expect("report");
        assert_eq!(w.completed_number, 3);
        assert_eq!(w.errors, vec!["page 2 failed".to_string()]);
        assert!(!w.in_error);
    }

    #[tokio::test]
    async fn negative_expectations_are_rejected_before_mutation() {
        let tracker = tracker();
        let p = Principal::system();
        let w = tracker
            .create_work(&p, &connector("c1"), "job-1", "u1", CreateWorkOptions::default())
            .await
            .expect("create");
        let err = tracker.add_expectations(&p, &w.id, -1).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        let unchanged = tracker
            .find_by_id(&p, &w.id)
            .await
            .expect("find")
            .expect("work");
        assert_eq!(unchanged.expected_number, 0);
    }

    #[tokio::test]
    async fn second_terminal_transition_conflicts_and_preserves_first() {
        let tracker = tracker();
        let p = Principal::system();
        let w = tracker
            .create_work(&p, &connector("c1"), "job-1", "u1", CreateWorkOptions::default())
            .await
            .expect("create");
        let done = tracker
            .update_processed_time(&p, &w.id, Some("done"), false)
            .await
            .expect("terminal");
        let first_processed = done.processed_at.expect("processed_at");
        let err = tracker
            .update_processed_time(&p, &w.id, Some("again"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
        let after = tracker
            .find_by_id(&p, &w.id)
            .await
            .expect("find")
            .expect("work");
        assert_eq!(after.processed_at, Some(first_processed));
        assert!(!after.in_error);
    }

    #[tokio::test]
    async fn failed_terminal_write_leaves_work_unchanged_and_retryable() {
        let store = Arc::new(RiggedStore::new());
        let tracker = WorkTracker::new(store.clone(), Bus::new(16), Duration::from_secs(5));
        let p = Principal::system();
        let w = tracker
            .create_work(&p, &connector("c1"), "job-1", "u1", CreateWorkOptions::default())
            .await
            .expect("create");
        store.fail_next_gated_merge.store(true, Ordering::SeqCst);
        let err = tracker
            .update_processed_time(&p, &w.id, Some("crashed"), true)
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "store outage must be retryable: {err}");
        // Nothing landed: no half-applied terminal state.
        let after = tracker
            .find_by_id(&p, &w.id)
            .await
            .expect("find")
            .expect("work");
        assert!(after.processed_at.is_none());
        assert!(!after.in_error);
        assert!(after.messages.is_empty());
        // The retry goes through with the full terminal state.
        let done = tracker
            .update_processed_time(&p, &w.id, Some("crashed"), true)
            .await
            .expect("retry");
        assert!(done.processed_at.is_some());
        assert!(done.in_error);
        assert_eq!(done.messages, vec!["crashed".to_string()]);
    }

    #[tokio::test]
    async fn empty_cascade_emits_no_delete_event() {
        let bus = Bus::new(16);
        let tracker = WorkTracker::new(
            Arc::new(MemStore::new()),
            bus.clone(),
            Duration::from_secs(5),
        );
        let p = Principal::system();
        let mut rx = bus.subscribe();
        let removed = tracker
            .delete_work_for_connector(&p, "connector--ghost")
            .await
            .expect("cascade");
        assert_eq!(removed, 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let w = tracker
            .create_work(&p, &connector("c1"), "job-1", "u1", CreateWorkOptions::default())
            .await
            .expect("create");
        let _ = rx.try_recv().expect("work.created");
        let removed = tracker
            .delete_work_for_connector(&p, &w.connector_id)
            .await
            .expect("cascade");
        assert_eq!(removed, 1);
        let env = rx.try_recv().expect("work.deleted");
        assert_eq!(env.topic, tip_topics::TOPIC_WORK_DELETED);
        assert_eq!(env.payload["removed"], 1);
    }

    #[tokio::test]
    async fn stalled_store_surfaces_timeout_from_batch_fetch() {
        let store = Arc::new(RiggedStore {
            stall_list: true,
            ..RiggedStore::new()
        });
        let fetch = WorksForConnectorFetch::new(store, Duration::from_millis(50));
        let err = fetch
            .fetch_many(&["c1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Internal(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn ping_work_refreshes_received_at() {
        let tracker = tracker();
        let p = Principal::system();
        let stale = Utc::now() - ChronoDuration::hours(2);
        let w = tracker
            .create_work(
                &p,
                &connector("c1"),
                "job-1",
                "u1",
                CreateWorkOptions {
                    received_time: Some(stale),
                },
            )
            .await
            .expect("create");
        assert_eq!(w.received_at, stale);
        let pinged = tracker.ping_work(&p, &w.id).await.expect("ping");
        assert!(pinged.received_at > stale);
        assert!(pinged.processed_at.is_none());
    }

    #[tokio::test]
    async fn delete_work_removes_the_record() {
        let tracker = tracker();
        let p = Principal::system();
        let w = tracker
            .create_work(&p, &connector("c1"), "job-1", "u1", CreateWorkOptions::default())
            .await
            .expect("create");
        tracker.delete_work(&p, &w.id).await.expect("delete");
        assert!(tracker.find_by_id(&p, &w.id).await.expect("find").is_none());
        let err = tracker.delete_work(&p, &w.id).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unknown_work_surfaces_not_found() {
        let tracker = tracker();
        let p = Principal::system();
        let err = tracker
            .update_received_time(&p, "work--missing", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound { .. }));
    }
}
