use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tip_events::Bus;
use tip_store::EntityStore;
use uuid::Uuid;

use crate::error::ControlError;
use crate::principal::Principal;
use crate::{parse_doc, store_call, KIND_SYNCHRONIZER};

/// Configured recurring remote-pull agent.
///
/// `current_state` is the opaque resume cursor into the remote stream;
/// like a connector checkpoint it is persisted verbatim and interpreted
/// only by the pull implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synchronizer {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub stream_id: String,
    #[serde(default)]
    pub filters: Value,
    pub user_id: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub current_state: String,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default)]
    pub listen_deletion: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterSyncInput {
    pub name: String,
    pub uri: String,
    pub stream_id: String,
    #[serde(default)]
    pub filters: Value,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default)]
    pub listen_deletion: bool,
}

/// Field-level edit; absent fields stay untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncFieldPatch {
    pub name: Option<String>,
    pub uri: Option<String>,
    pub stream_id: Option<String>,
    pub filters: Option<Value>,
    pub ssl_verify: Option<bool>,
    pub listen_deletion: Option<bool>,
}

/// Outcome of a stateless connectivity test. Expected network or auth
/// failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum SyncTestOutcome {
    Reachable,
    Unreachable { reason: String },
}

impl SyncTestOutcome {
    /// Escalate an unreachable outcome into the typed error, for callers
    /// that treat the test as a gate.
    pub fn into_result(self) -> Result<(), ControlError> {
        match self {
            SyncTestOutcome::Reachable => Ok(()),
            SyncTestOutcome::Unreachable { reason } => Err(ControlError::Connectivity(reason)),
        }
    }
}

/// Reachability/credential check against a remote stream endpoint.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `Err(reason)` for an expected connectivity/auth failure.
    async fn probe(&self, uri: &str, stream_id: &str) -> Result<(), String>;
}

/// One pull cycle against the remote origin. Returns the advanced cursor,
/// or `None` when the stream had nothing new.
#[async_trait]
pub trait RemotePull: Send + Sync {
    async fn pull(&self, sync: &Synchronizer) -> Result<Option<String>, String>;
}

/// Placeholder pull used when no ingestion pipeline is wired in; it never
/// advances the cursor.
pub struct NoopPull;

#[async_trait]
impl RemotePull for NoopPull {
    async fn pull(&self, _sync: &Synchronizer) -> Result<Option<String>, String> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct SyncScheduler {
    store: Arc<dyn EntityStore>,
    bus: Bus,
    probe: Arc<dyn ConnectivityProbe>,
    pull: Arc<dyn RemotePull>,
    store_timeout: Duration,
    tick: Duration,
    /// Puller generation per synchronizer id. Spawning bumps the
    /// generation; a loop holding a stale one exits on its next tick, so
    /// stop-then-start inside a single tick never leaves two loops alive.
    pullers: Arc<Mutex<HashMap<String, u64>>>,
}

fn lock_pullers(map: &Mutex<HashMap<String, u64>>) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

fn validate_target(uri: &str) -> Result<(), ControlError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(ControlError::Validation("sync target uri is empty".into()));
    }
    if !(uri.starts_with("http://") || uri.starts_with("https://")) {
        return Err(ControlError::Validation(format!(
            "sync target uri must be http(s), got {uri}"
        )));
    }
    Ok(())
}

impl SyncScheduler {
    pub fn new(
        store: Arc<dyn EntityStore>,
        bus: Bus,
        probe: Arc<dyn ConnectivityProbe>,
        pull: Arc<dyn RemotePull>,
        store_timeout: Duration,
        tick: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            probe,
            pull,
            store_timeout,
            tick,
            pullers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn register_sync(
        &self,
        principal: &Principal,
        input: RegisterSyncInput,
    ) -> Result<Synchronizer, ControlError> {
        if input.name.trim().is_empty() {
            return Err(ControlError::Validation("sync name is empty".into()));
        }
        validate_target(&input.uri)?;
        let now = Utc::now();
        let sync = Synchronizer {
            id: format!("sync--{}", Uuid::new_v4()),
            name: input.name.trim().to_string(),
            uri: input.uri.trim().to_string(),
            stream_id: input.stream_id,
            filters: input.filters,
            user_id: principal.id.clone(),
            running: false,
            current_state: String::new(),
            ssl_verify: input.ssl_verify,
            listen_deletion: input.listen_deletion,
            created_at: now,
            updated_at: now,
        };
        let doc = serde_json::to_value(&sync)
            .map_err(|e| ControlError::Internal(format!("serialize synchronizer: {e}")))?;
        store_call(
            self.store_timeout,
            self.store.put(KIND_SYNCHRONIZER, &sync.id, doc),
        )
        .await?;
        tracing::debug!(sync = %sync.id, "synchronizer registered");
        self.bus
            .publish(tip_topics::TOPIC_SYNC_REGISTERED, &principal.id, &sync);
        Ok(sync)
    }

    pub async fn sync_edit_field(
        &self,
        principal: &Principal,
        id: &str,
        patch: SyncFieldPatch,
    ) -> Result<Synchronizer, ControlError> {
        if let Some(uri) = patch.uri.as_deref() {
            validate_target(uri)?;
        }
        let mut merge = serde_json::Map::new();
        if let Some(name) = patch.name {
            merge.insert("name".into(), json!(name));
        }
        if let Some(uri) = patch.uri {
            merge.insert("uri".into(), json!(uri.trim()));
        }
        if let Some(stream_id) = patch.stream_id {
            merge.insert("stream_id".into(), json!(stream_id));
        }
        if let Some(filters) = patch.filters {
            merge.insert("filters".into(), filters);
        }
        if let Some(ssl_verify) = patch.ssl_verify {
            merge.insert("ssl_verify".into(), json!(ssl_verify));
        }
        if let Some(listen_deletion) = patch.listen_deletion {
            merge.insert("listen_deletion".into(), json!(listen_deletion));
        }
        merge.insert("updated_at".into(), json!(Utc::now()));
        let doc = store_call(
            self.store_timeout,
            self.store.merge(KIND_SYNCHRONIZER, id, Value::Object(merge)),
        )
        .await?;
        let sync: Synchronizer = parse_doc(doc)?;
        self.bus
            .publish(tip_topics::TOPIC_SYNC_UPDATED, &principal.id, &sync);
        Ok(sync)
    }

    pub async fn sync_edit_context(
        &self,
        principal: &Principal,
        id: &str,
        state: &str,
    ) -> Result<Synchronizer, ControlError> {
        let doc = store_call(
            self.store_timeout,
            self.store.merge(
                KIND_SYNCHRONIZER,
                id,
                json!({"current_state": state, "updated_at": Utc::now()}),
            ),
        )
        .await?;
        let sync: Synchronizer = parse_doc(doc)?;
        self.bus
            .publish(tip_topics::TOPIC_SYNC_CONTEXT_UPDATED, &principal.id, &sync);
        Ok(sync)
    }

    /// Resets the resume cursor so the next run re-pulls the remote stream
    /// from its origin.
    pub async fn sync_clean_context(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<Synchronizer, ControlError> {
        let doc = store_call(
            self.store_timeout,
            self.store.merge(
                KIND_SYNCHRONIZER,
                id,
                json!({"current_state": "", "updated_at": Utc::now()}),
            ),
        )
        .await?;
        let sync: Synchronizer = parse_doc(doc)?;
        self.bus
            .publish(tip_topics::TOPIC_SYNC_CONTEXT_CLEANED, &principal.id, &sync);
        Ok(sync)
    }

    /// The only legal Stopped ⇄ Running transition. Idempotent: repeating
    /// the current state is a successful no-op (no event, no new puller).
    pub async fn patch_sync(
        &self,
        principal: &Principal,
        id: &str,
        running: bool,
    ) -> Result<Synchronizer, ControlError> {
        let current = self.require_sync(id).await?;
        if current.running == running {
            return Ok(current);
        }
        let doc = store_call(
            self.store_timeout,
            self.store.merge(
                KIND_SYNCHRONIZER,
                id,
                json!({"running": running, "updated_at": Utc::now()}),
            ),
        )
        .await?;
        let sync: Synchronizer = parse_doc(doc)?;
        let topic = if running {
            tip_topics::TOPIC_SYNC_STARTED
        } else {
            tip_topics::TOPIC_SYNC_STOPPED
        };
        self.bus.publish(topic, &principal.id, &sync);
        if running {
            self.spawn_puller(sync.id.clone());
        } else {
            self.retire_puller(id);
        }
        Ok(sync)
    }

    /// Stateless reachability/credential test; nothing is persisted and no
    /// existing synchronizer is required.
    pub async fn test_sync(
        &self,
        _principal: &Principal,
        input: &RegisterSyncInput,
    ) -> Result<SyncTestOutcome, ControlError> {
        validate_target(&input.uri)?;
        match self.probe.probe(&input.uri, &input.stream_id).await {
            Ok(()) => Ok(SyncTestOutcome::Reachable),
            Err(reason) => Ok(SyncTestOutcome::Unreachable { reason }),
        }
    }

    pub async fn sync_delete(&self, principal: &Principal, id: &str) -> Result<(), ControlError> {
        let sync = self.require_sync(id).await?;
        store_call(self.store_timeout, self.store.delete(KIND_SYNCHRONIZER, id)).await?;
        self.retire_puller(id);
        tracing::debug!(sync = %id, "synchronizer deleted");
        self.bus
            .publish(tip_topics::TOPIC_SYNC_DELETED, &principal.id, &sync);
        Ok(())
    }

    pub async fn find_sync_by_id(
        &self,
        _principal: &Principal,
        id: &str,
    ) -> Result<Option<Synchronizer>, ControlError> {
        let doc = store_call(self.store_timeout, self.store.get(KIND_SYNCHRONIZER, id)).await?;
        doc.map(parse_doc).transpose()
    }

    pub async fn find_all_sync(
        &self,
        _principal: &Principal,
    ) -> Result<Vec<Synchronizer>, ControlError> {
        let docs = store_call(self.store_timeout, self.store.list(KIND_SYNCHRONIZER)).await?;
        docs.into_iter().map(parse_doc).collect()
    }

    /// Respawn pullers for synchronizers already marked running, e.g. after
    /// a process restart. Returns how many were resumed.
    pub async fn resume_pullers(&self, principal: &Principal) -> Result<usize, ControlError> {
        let running: Vec<Synchronizer> = self
            .find_all_sync(principal)
            .await?
            .into_iter()
            .filter(|s| s.running)
            .collect();
        for sync in &running {
            self.spawn_puller(sync.id.clone());
        }
        Ok(running.len())
    }

    async fn require_sync(&self, id: &str) -> Result<Synchronizer, ControlError> {
        let doc = store_call(self.store_timeout, self.store.get(KIND_SYNCHRONIZER, id))
            .await?
            .ok_or_else(|| ControlError::NotFound {
                kind: KIND_SYNCHRONIZER.into(),
                id: id.into(),
            })?;
        parse_doc(doc)
    }

    /// Invalidate the current generation so any live loop for `id` exits on
    /// its next tick. Bumps rather than removes: removal would reset the
    /// counter and let a later spawn reissue a generation a stale loop
    /// still holds.
    fn retire_puller(&self, id: &str) {
        if let Some(slot) = lock_pullers(&self.pullers).get_mut(id) {
            *slot += 1;
        }
    }

    /// Interval loop driving one pull cycle per tick. The loop re-reads its
    /// record each heartbeat and exits as soon as the synchronizer is gone
    /// or no longer running, which is how `sync_delete` is observed. It also
    /// checks its generation against the scheduler's map, so a later
    /// `spawn_puller` for the same id supersedes it.
    fn spawn_puller(&self, id: String) {
        let generation = {
            let mut map = lock_pullers(&self.pullers);
            let slot = map.entry(id.clone()).or_insert(0);
            *slot += 1;
            *slot
        };
        let store = self.store.clone();
        let pull = self.pull.clone();
        let pullers = self.pullers.clone();
        let store_timeout = self.store_timeout;
        let tick = self.tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if lock_pullers(&pullers).get(&id).copied() != Some(generation) {
                    tracing::debug!(sync = %id, generation, "superseded puller exiting");
                    break;
                }
                let doc = match store_call(store_timeout, store.get(KIND_SYNCHRONIZER, &id)).await
                {
                    Ok(doc) => doc,
                    Err(err) => {
                        tracing::warn!(sync = %id, %err, "puller heartbeat load failed");
                        continue;
                    }
                };
                let Some(doc) = doc else {
                    tracing::debug!(sync = %id, "synchronizer deleted, stopping puller");
                    break;
                };
                let sync: Synchronizer = match serde_json::from_value(doc) {
                    Ok(sync) => sync,
                    Err(err) => {
                        tracing::warn!(sync = %id, %err, "corrupt synchronizer record");
                        break;
                    }
                };
                if !sync.running {
                    tracing::debug!(sync = %id, "synchronizer stopped, ending puller");
                    break;
                }
                match pull.pull(&sync).await {
                    Ok(Some(cursor)) => {
                        let patch = json!({"current_state": cursor, "updated_at": Utc::now()});
                        if let Err(err) =
                            store_call(store_timeout, store.merge(KIND_SYNCHRONIZER, &id, patch))
                                .await
                        {
                            tracing::warn!(sync = %id, %err, "cursor advance failed");
                        }
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        tracing::warn!(sync = %id, reason, "pull cycle failed");
                    }
                }
            }
        });
    }
}
