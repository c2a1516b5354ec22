use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Event envelope for control-plane mutations (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub topic: String,
    /// Id of the principal on whose behalf the mutation ran.
    pub principal: String,
    pub payload: Value,
}

/// Best-effort broadcast bus for mutation notifications.
///
/// Publishing never fails: a payload that cannot serialize or a send with
/// no live subscribers is logged and dropped. The bus is a notification
/// channel, not a durability boundary.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, topic: &str, principal: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(topic, %err, "dropping unserializable event payload");
                return;
            }
        };
        if self
            .tx
            .send(Envelope {
                time: now,
                topic: topic.to_string(),
                principal: principal.to_string(),
                payload: val,
            })
            .is_err()
        {
            tracing::debug!(topic, "no subscribers for event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber_with_principal() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("connector.ping", "user-1", &json!({"id": "c1"}));
        let env = rx.recv().await.expect("envelope");
        assert_eq!(env.topic, "connector.ping");
        assert_eq!(env.principal, "user-1");
        assert_eq!(env.payload["id"], "c1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = Bus::new(8);
        // No receiver attached; must not panic or error.
        bus.publish("work.created", "user-1", &json!({"id": "w1"}));
    }
}
