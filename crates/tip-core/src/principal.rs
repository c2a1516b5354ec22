use serde::{Deserialize, Serialize};

/// The already-authenticated actor an operation runs on behalf of.
///
/// Capability checks happen upstream of this subsystem; the control plane
/// only stamps the principal into ownership fields and event envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Internal actor used by schedulers and maintenance loops.
    pub fn system() -> Self {
        Self::new("system", "system")
    }
}
