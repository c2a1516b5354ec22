//! Control plane for external threat-intelligence connectors.
//!
//! Tracks connector lifecycle, the asynchronous Work they emit with its
//! expectation accounting, and scheduled remote-pull synchronizers.
//! Persistence and the notification bus are seams (`tip-store`,
//! `tip-events`); the transport layer that routes external calls onto
//! these typed interfaces lives outside this crate.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tip_events::Bus;
use tip_store::{EntityStore, StoreError};

pub mod config;
pub mod connector;
pub mod error;
pub mod loader;
pub mod principal;
pub mod status;
pub mod sync;
pub mod work;

pub use config::{load_config, ControlPlaneConfig};
pub use connector::{Capability, Connector, ConnectorRegistry, RegisterConnectorInput};
pub use error::ControlError;
pub use loader::{BatchFetch, BatchLoader};
pub use principal::Principal;
pub use status::{compute_work_status, WorkStatus, WorkTracking};
pub use sync::{
    ConnectivityProbe, NoopPull, RegisterSyncInput, RemotePull, SyncFieldPatch, SyncScheduler,
    SyncTestOutcome, Synchronizer,
};
pub use work::{
    ConnectorForWorkFetch, CreateWorkOptions, Work, WorkTracker, WorksForConnectorFetch,
};

pub const KIND_CONNECTOR: &str = "connector";
pub const KIND_WORK: &str = "work";
pub const KIND_SYNCHRONIZER: &str = "synchronizer";

/// Bounded store round trip: a timeout surfaces as a retryable internal
/// error instead of blocking the caller indefinitely.
pub(crate) async fn store_call<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, ControlError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(ControlError::from),
        Err(_) => Err(ControlError::Internal(format!(
            "store call exceeded {}ms",
            limit.as_millis()
        ))),
    }
}

pub(crate) fn parse_doc<T: serde::de::DeserializeOwned>(doc: Value) -> Result<T, ControlError> {
    serde_json::from_value(doc).map_err(|e| ControlError::Internal(format!("corrupt record: {e}")))
}

/// Everything wired together over one store and one bus.
#[derive(Clone)]
pub struct ControlPlane {
    store: Arc<dyn EntityStore>,
    store_timeout: Duration,
    pub bus: Bus,
    pub connectors: ConnectorRegistry,
    pub works: WorkTracker,
    pub syncs: SyncScheduler,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn EntityStore>,
        config: &ControlPlaneConfig,
        probe: Arc<dyn ConnectivityProbe>,
        pull: Arc<dyn RemotePull>,
    ) -> Self {
        let bus = Bus::new(config.bus_capacity);
        let timeout = config.store_timeout();
        let works = WorkTracker::new(store.clone(), bus.clone(), timeout);
        let connectors =
            ConnectorRegistry::new(store.clone(), bus.clone(), works.clone(), timeout);
        let syncs = SyncScheduler::new(
            store.clone(),
            bus.clone(),
            probe,
            pull,
            timeout,
            config.sync_tick(),
        );
        Self {
            store,
            store_timeout: timeout,
            bus,
            connectors,
            works,
            syncs,
        }
    }

    /// Fresh request-scoped loader for Work-by-connector lookups. Build one
    /// per inbound request and drop it with the request.
    pub fn works_for_connector_loader(&self) -> BatchLoader<WorksForConnectorFetch> {
        BatchLoader::new(WorksForConnectorFetch::new(
            self.store.clone(),
            self.store_timeout,
        ))
    }

    /// Fresh request-scoped loader for Connector-by-work lookups.
    pub fn connector_for_work_loader(&self) -> BatchLoader<ConnectorForWorkFetch> {
        BatchLoader::new(ConnectorForWorkFetch::new(
            self.store.clone(),
            self.store_timeout,
        ))
    }
}
