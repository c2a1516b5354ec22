use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::error::ControlError;

/// One underlying query serving a whole batch of keys.
#[async_trait]
pub trait BatchFetch: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Resolve every key in one store round trip. Keys with no backing
    /// entity are simply absent from the returned map.
    async fn fetch_many(
        &self,
        keys: &[Self::Key],
    ) -> Result<HashMap<Self::Key, Self::Value>, ControlError>;
}

type Waiter<V> = oneshot::Sender<Result<Option<V>, ControlError>>;

struct LoaderState<K, V> {
    cache: HashMap<K, Option<V>>,
    pending: HashMap<K, Vec<Waiter<V>>>,
    dispatch_scheduled: bool,
}

/// Request-scoped batching loader.
///
/// Concurrent `load` calls issued within one request coalesce: keys are
/// deduplicated and resolved through a single `fetch_many`, each caller
/// receiving its own result. Results are cached only for the lifetime of
/// this loader instance — the loader is built per request and dropped
/// with it, never promoted to a process-wide cache.
pub struct BatchLoader<F: BatchFetch> {
    fetch: Arc<F>,
    state: Arc<Mutex<LoaderState<F::Key, F::Value>>>,
}

impl<F: BatchFetch> Clone for BatchLoader<F> {
    fn clone(&self) -> Self {
        Self {
            fetch: self.fetch.clone(),
            state: self.state.clone(),
        }
    }
}

impl<F: BatchFetch> BatchLoader<F> {
    pub fn new(fetch: F) -> Self {
        Self {
            fetch: Arc::new(fetch),
            state: Arc::new(Mutex::new(LoaderState {
                cache: HashMap::new(),
                pending: HashMap::new(),
                dispatch_scheduled: false,
            })),
        }
    }

    pub async fn load(&self, key: F::Key) -> Result<Option<F::Value>, ControlError> {
        let rx = {
            let mut state = self.state.lock().await;
            if let Some(hit) = state.cache.get(&key) {
                return Ok(hit.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.pending.entry(key).or_default().push(tx);
            if !state.dispatch_scheduled {
                state.dispatch_scheduled = true;
                let this = self.clone();
                tokio::spawn(async move {
                    // Let sibling loads of the same request enqueue first.
                    tokio::task::yield_now().await;
                    this.dispatch().await;
                });
            }
            rx
        };
        rx.await
            .map_err(|_| ControlError::Internal("batch loader dispatch dropped".into()))?
    }

    async fn dispatch(&self) {
        let pending = {
            let mut state = self.state.lock().await;
            state.dispatch_scheduled = false;
            std::mem::take(&mut state.pending)
        };
        if pending.is_empty() {
            return;
        }
        let keys: Vec<F::Key> = pending.keys().cloned().collect();
        match self.fetch.fetch_many(&keys).await {
            Ok(mut results) => {
                let mut state = self.state.lock().await;
                for (key, waiters) in pending {
                    let value = results.remove(&key);
                    state.cache.insert(key, value.clone());
                    for waiter in waiters {
                        let _ = waiter.send(Ok(value.clone()));
                    }
                }
            }
            Err(err) => {
                // Errors are not cached; every waiter gets the diagnostic.
                let msg = err.to_string();
                for waiters in pending.into_values() {
                    for waiter in waiters {
                        let _ = waiter.send(Err(ControlError::Internal(msg.clone())));
                    }
                }
            }
        }
    }
}
