//! Cancellation tokens for running tasks.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
struct Entry {
    token: CancellationToken,
    requested: bool,
}

/// Maps running task ids to the token their handler watches.
///
/// A request may arrive before the worker registers the task (the claim and
/// the registration are two steps). It is remembered, and `register` then
/// hands out an already-cancelled token.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a task about to run. Cancelled with `parent` (engine shutdown)
    /// or by [`CancelRegistry::request`].
    pub async fn register(&self, id: Uuid, parent: &CancellationToken) -> CancellationToken {
        let mut entries = self.entries.lock().await;
        let token = parent.child_token();
        let requested = entries.get(&id).is_some_and(|e| e.requested);
        if requested {
            token.cancel();
        }
        entries.insert(
            id,
            Entry {
                token: token.clone(),
                requested,
            },
        );
        token
    }

    /// Ask the handler of `id` to stop. Returns true if a handler was registered.
    pub async fn request(&self, id: Uuid) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.requested = true;
                entry.token.cancel();
                true
            }
            None => {
                let token = CancellationToken::new();
                token.cancel();
                entries.insert(
                    id,
                    Entry {
                        token,
                        requested: true,
                    },
                );
                false
            }
        }
    }

    /// Whether a user cancellation was requested for `id`.
    pub async fn is_requested(&self, id: Uuid) -> bool {
        self.entries
            .lock()
            .await
            .get(&id)
            .is_some_and(|e| e.requested)
    }

    /// Forget `id`, returning whether a cancellation had been requested.
    pub async fn remove(&self, id: Uuid) -> bool {
        self.entries
            .lock()
            .await
            .remove(&id)
            .is_some_and(|e| e.requested)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_cancels_registered_token() {
        let registry = CancelRegistry::new();
        let shutdown = CancellationToken::new();
        let id = Uuid::new_v4();

        let token = registry.register(id, &shutdown).await;
        assert!(!token.is_cancelled());

        assert!(registry.request(id).await);
        assert!(token.is_cancelled());
        assert!(registry.remove(id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn early_request_is_remembered() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();

        assert!(!registry.request(id).await);
        let token = registry.register(id, &CancellationToken::new()).await;
        assert!(token.is_cancelled());
        assert!(registry.is_requested(id).await);
    }

    #[tokio::test]
    async fn shutdown_is_not_a_user_request() {
        let registry = CancelRegistry::new();
        let shutdown = CancellationToken::new();
        let id = Uuid::new_v4();

        let token = registry.register(id, &shutdown).await;
        shutdown.cancel();
        assert!(token.is_cancelled());
        assert!(!registry.remove(id).await);
    }
}
