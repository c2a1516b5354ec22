//! Canonical event topic constants for control-plane mutations.
//!
//! Every mutating operation publishes exactly one event on success; the
//! topic strings live here so publishers and subscribers stay in sync.
//! Keep each section alphabetized and favor dot.case names.

// Connector lifecycle
pub const TOPIC_CONNECTOR_DELETED: &str = "connector.deleted";
pub const TOPIC_CONNECTOR_PING: &str = "connector.ping";
pub const TOPIC_CONNECTOR_REGISTERED: &str = "connector.registered";
pub const TOPIC_CONNECTOR_STATE_RESET: &str = "connector.state.reset";

// Work tracking
pub const TOPIC_WORK_CREATED: &str = "work.created";
/// Payload is the deleted Work for a single delete, or
/// `{connector_id, removed}` for a connector cascade. The cascade form is
/// only published when `removed > 0`.
pub const TOPIC_WORK_DELETED: &str = "work.deleted";
pub const TOPIC_WORK_EXPECTATIONS_ADDED: &str = "work.expectations.added";
pub const TOPIC_WORK_EXPECTATION_REPORTED: &str = "work.expectation.reported";
pub const TOPIC_WORK_PROCESSED: &str = "work.processed";
pub const TOPIC_WORK_RECEIVED: &str = "work.received";

// Synchronizer lifecycle
pub const TOPIC_SYNC_CONTEXT_CLEANED: &str = "sync.context.cleaned";
pub const TOPIC_SYNC_CONTEXT_UPDATED: &str = "sync.context.updated";
pub const TOPIC_SYNC_DELETED: &str = "sync.deleted";
pub const TOPIC_SYNC_REGISTERED: &str = "sync.registered";
pub const TOPIC_SYNC_STARTED: &str = "sync.started";
pub const TOPIC_SYNC_STOPPED: &str = "sync.stopped";
pub const TOPIC_SYNC_UPDATED: &str = "sync.updated";
