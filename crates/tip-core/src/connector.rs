use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tip_events::Bus;
use tip_store::EntityStore;

use crate::error::ControlError;
use crate::principal::Principal;
use crate::work::WorkTracker;
use crate::{parse_doc, store_call, KIND_CONNECTOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Import,
    Export,
    Worker,
    Internal,
}

/// Registered external connector process.
///
/// `connector_state` is an opaque checkpoint blob owned entirely by the
/// connector; the core persists it verbatim and never parses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    pub active: bool,
    #[serde(default)]
    pub connector_state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterConnectorInput {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
}

#[derive(Clone)]
pub struct ConnectorRegistry {
    store: Arc<dyn EntityStore>,
    bus: Bus,
    works: WorkTracker,
    store_timeout: Duration,
}

impl ConnectorRegistry {
    pub fn new(
        store: Arc<dyn EntityStore>,
        bus: Bus,
        works: WorkTracker,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            works,
            store_timeout,
        }
    }

    /// Idempotent registration. A connector re-registering after a restart
    /// gets its mutable fields refreshed while `connector_state` survives,
    /// so checkpoints outlive redeploys.
    pub async fn register_connector(
        &self,
        principal: &Principal,
        input: RegisterConnectorInput,
    ) -> Result<Connector, ControlError> {
        let id = input.id.trim();
        let name = input.name.trim();
        if id.is_empty() {
            return Err(ControlError::Validation("connector id is empty".into()));
        }
        if name.is_empty() {
            return Err(ControlError::Validation("connector name is empty".into()));
        }
        if input.capabilities.is_empty() {
            return Err(ControlError::Validation(format!(
                "connector {id} declares no capabilities"
            )));
        }
        let existing = store_call(self.store_timeout, self.store.get(KIND_CONNECTOR, id)).await?;
        let connector = match existing {
            Some(_) => {
                let patch = json!({
                    "name": name,
                    "capabilities": input.capabilities,
                    "active": true,
                    "updated_at": Utc::now(),
                });
                let doc =
                    store_call(self.store_timeout, self.store.merge(KIND_CONNECTOR, id, patch))
                        .await?;
                parse_doc::<Connector>(doc)?
            }
            None => {
                let now = Utc::now();
                let connector = Connector {
                    id: id.to_string(),
                    name: name.to_string(),
                    capabilities: input.capabilities,
                    active: true,
                    connector_state: String::new(),
                    created_at: now,
                    updated_at: now,
                };
                let doc = serde_json::to_value(&connector)
                    .map_err(|e| ControlError::Internal(format!("serialize connector: {e}")))?;
                store_call(self.store_timeout, self.store.put(KIND_CONNECTOR, id, doc)).await?;
                connector
            }
        };
        tracing::debug!(connector = %connector.id, "connector registered");
        self.bus
            .publish(tip_topics::TOPIC_CONNECTOR_REGISTERED, &principal.id, &connector);
        Ok(connector)
    }

    /// Heartbeat, safe at high frequency: touches `updated_at` and, when a
    /// checkpoint is supplied, `connector_state` — nothing else.
    pub async fn ping_connector(
        &self,
        principal: &Principal,
        id: &str,
        state: Option<&str>,
    ) -> Result<Connector, ControlError> {
        let mut patch = json!({"updated_at": Utc::now()});
        if let Some(state) = state {
            patch["connector_state"] = json!(state);
        }
        let doc =
            store_call(self.store_timeout, self.store.merge(KIND_CONNECTOR, id, patch)).await?;
        let connector: Connector = parse_doc(doc)?;
        self.bus
            .publish(tip_topics::TOPIC_CONNECTOR_PING, &principal.id, &connector);
        Ok(connector)
    }

    /// Operator action: wipe the connector's checkpoint so its next run
    /// starts from scratch. Heartbeat fields are left alone.
    pub async fn reset_state_connector(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<Connector, ControlError> {
        let doc = store_call(
            self.store_timeout,
            self.store
                .merge(KIND_CONNECTOR, id, json!({"connector_state": ""})),
        )
        .await?;
        let connector: Connector = parse_doc(doc)?;
        self.bus.publish(
            tip_topics::TOPIC_CONNECTOR_STATE_RESET,
            &principal.id,
            &connector,
        );
        Ok(connector)
    }

    /// Deletes the connector and every Work it owns. The cascade runs
    /// first; if it fails the connector record stays and no deletion event
    /// is published.
    pub async fn connector_delete(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<(), ControlError> {
        let doc = store_call(self.store_timeout, self.store.get(KIND_CONNECTOR, id))
            .await?
            .ok_or_else(|| ControlError::NotFound {
                kind: KIND_CONNECTOR.into(),
                id: id.into(),
            })?;
        let connector: Connector = parse_doc(doc)?;
        self.works.delete_work_for_connector(principal, id).await?;
        store_call(self.store_timeout, self.store.delete(KIND_CONNECTOR, id)).await?;
        tracing::debug!(connector = %id, "connector deleted");
        self.bus
            .publish(tip_topics::TOPIC_CONNECTOR_DELETED, &principal.id, &connector);
        Ok(())
    }

    pub async fn load_connector_by_id(
        &self,
        _principal: &Principal,
        id: &str,
    ) -> Result<Connector, ControlError> {
        let doc = store_call(self.store_timeout, self.store.get(KIND_CONNECTOR, id))
            .await?
            .ok_or_else(|| ControlError::NotFound {
                kind: KIND_CONNECTOR.into(),
                id: id.into(),
            })?;
        parse_doc(doc)
    }

    pub async fn connectors(&self, _principal: &Principal) -> Result<Vec<Connector>, ControlError> {
        let docs = store_call(self.store_timeout, self.store.list(KIND_CONNECTOR)).await?;
        docs.into_iter().map(parse_doc).collect()
    }

    pub async fn connectors_for_import(
        &self,
        principal: &Principal,
    ) -> Result<Vec<Connector>, ControlError> {
        self.connectors_with(principal, Capability::Import).await
    }

    pub async fn connectors_for_export(
        &self,
        principal: &Principal,
    ) -> Result<Vec<Connector>, ControlError> {
        self.connectors_with(principal, Capability::Export).await
    }

    pub async fn connectors_for_worker(
        &self,
        principal: &Principal,
    ) -> Result<Vec<Connector>, ControlError> {
        self.connectors_with(principal, Capability::Worker).await
    }

    async fn connectors_with(
        &self,
        principal: &Principal,
        capability: Capability,
    ) -> Result<Vec<Connector>, ControlError> {
        Ok(self
            .connectors(principal)
            .await?
            .into_iter()
            .filter(|c| c.capabilities.contains(&capability))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tip_store::MemStore;

    fn registry() -> (ConnectorRegistry, WorkTracker) {
        let store: Arc<dyn EntityStore> = Arc::new(MemStore::new());
        let bus = Bus::new(16);
        let works = WorkTracker::new(store.clone(), bus.clone(), Duration::from_secs(5));
        (
            ConnectorRegistry::new(store, bus, works.clone(), Duration::from_secs(5)),
            works,
        )
    }

    fn input(id: &str, caps: &[Capability]) -> RegisterConnectorInput {
        RegisterConnectorInput {
            id: id.to_string(),
            name: format!("{id}-name"),
            capabilities: caps.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn reregistration_preserves_connector_state() {
        let (registry, _) = registry();
        let p = Principal::system();
        registry
            .register_connector(&p, input("c1", &[Capability::Import]))
            .await
            .expect("register");
        registry
            .ping_connector(&p, "c1", Some("cursor=42"))
            .await
            .expect("ping");
        let again = registry
            .register_connector(&p, input("c1", &[Capability::Import, Capability::Worker]))
            .await
            .expect("re-register");
        assert_eq!(again.connector_state, "cursor=42");
        assert!(again.capabilities.contains(&Capability::Worker));
        // Still exactly one record.
        assert_eq!(registry.connectors(&p).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn empty_capability_set_is_rejected() {
        let (registry, _) = registry();
        let err = registry
            .register_connector(&Principal::system(), input("c1", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[tokio::test]
    async fn ping_without_state_leaves_checkpoint_alone() {
        let (registry, _) = registry();
        let p = Principal::system();
        registry
            .register_connector(&p, input("c1", &[Capability::Import]))
            .await
            .expect("register");
        registry
            .ping_connector(&p, "c1", Some("chk-1"))
            .await
            .expect("ping");
        let before = registry
            .load_connector_by_id(&p, "c1")
            .await
            .expect("load");
        let after = registry.ping_connector(&p, "c1", None).await.expect("ping");
        assert_eq!(after.connector_state, "chk-1");
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn reset_state_clears_only_the_checkpoint() {
        let (registry, _) = registry();
        let p = Principal::system();
        registry
            .register_connector(&p, input("c1", &[Capability::Import]))
            .await
            .expect("register");
        registry
            .ping_connector(&p, "c1", Some("chk-9"))
            .await
            .expect("ping");
        let reset = registry
            .reset_state_connector(&p, "c1")
            .await
            .expect("reset");
        assert_eq!(reset.connector_state, "");
        assert!(reset.active);
    }

    #[tokio::test]
    async fn delete_cascades_to_owned_work() {
        let (registry, works) = registry();
        let p = Principal::system();
        let c = registry
            .register_connector(&p, input("c1", &[Capability::Import]))
            .await
            .expect("register");
        for i in 0..3 {
            works
                .create_work(&p, &c, &format!("job-{i}"), "u1", Default::default())
                .await
                .expect("work");
        }
        registry.connector_delete(&p, "c1").await.expect("delete");
        assert!(works
            .works_for_connector(&p, "c1")
            .await
            .expect("list")
            .is_empty());
        let err = registry
            .load_connector_by_id(&p, "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound { .. }));
    }

    #[tokio::test]
    async fn capability_listings_filter_membership() {
        let (registry, _) = registry();
        let p = Principal::system();
        registry
            .register_connector(&p, input("imp", &[Capability::Import]))
            .await
            .expect("register");
        registry
            .register_connector(&p, input("exp", &[Capability::Export, Capability::Worker]))
            .await
            .expect("register");
        let imports = registry.connectors_for_import(&p).await.expect("imports");
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].id, "imp");
        let workers = registry.connectors_for_worker(&p).await.expect("workers");
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, "exp");
    }
}
