//! Per-parent serialized delivery.
//!
//! Every parent session gets a chain of delivery operations. An operation
//! starts only after the previous one for the same parent has settled, so
//! deliveries to one parent never overlap; different parents proceed
//! independently. A failing operation is logged and does not hold up the
//! rest of its chain.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::domain::errors::DomainResult;

type Chain = Shared<BoxFuture<'static, ()>>;

#[derive(Clone, Default)]
pub struct NotificationSerializer {
    chains: Arc<Mutex<HashMap<String, Chain>>>,
}

impl NotificationSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn chains(&self) -> MutexGuard<'_, HashMap<String, Chain>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `operation` behind everything already queued for `parent_session_id`.
    pub fn enqueue<F>(&self, parent_session_id: &str, operation: F)
    where
        F: Future<Output = DomainResult<()>> + Send + 'static,
    {
        let parent = parent_session_id.to_string();
        let mut chains = self.chains();
        let previous = chains.remove(&parent);

        let label = parent.clone();
        let link: Chain = async move {
            if let Some(previous) = previous {
                previous.await;
            }
            if let Err(err) = operation.await {
                warn!(parent_session_id = %label, error = %err, "notification delivery failed");
            }
        }
        .boxed()
        .shared();

        chains.insert(parent.clone(), link.clone());
        drop(chains);

        let registry = self.chains.clone();
        tokio::spawn(async move {
            link.clone().await;
            let mut chains = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if chains
                .get(&parent)
                .is_some_and(|tail| tail.ptr_eq(&link))
            {
                chains.remove(&parent);
                debug!(parent_session_id = %parent, "notification chain drained");
            }
        });
    }

    /// Wait until everything queued so far for `parent_session_id` has settled.
    pub async fn flush(&self, parent_session_id: &str) {
        let tail = self.chains().get(parent_session_id).cloned();
        if let Some(tail) = tail {
            tail.await;
        }
    }

    /// Whether `parent_session_id` has deliveries in flight.
    #[cfg(test)]
    pub fn is_busy(&self, parent_session_id: &str) -> bool {
        self.chains().contains_key(parent_session_id)
    }

    /// Forget every chain. Operations already spawned run to completion.
    pub fn clear(&self) {
        self.chains().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::DomainError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_parent_never_overlaps() {
        let serializer = NotificationSerializer::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5u64 {
            let active = active.clone();
            let max_active = max_active.clone();
            let order = order.clone();
            serializer.enqueue("parent", async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                order.lock().unwrap().push(i);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        serializer.flush("parent").await;

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_chain() {
        let serializer = NotificationSerializer::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        serializer.enqueue("parent", async {
            Err(DomainError::NotificationDeliveryFailed("sink down".to_string()))
        });
        let counter = delivered.clone();
        serializer.enqueue("parent", async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        serializer.flush("parent").await;

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parents_run_independently() {
        let serializer = NotificationSerializer::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let other_done = Arc::new(AtomicUsize::new(0));

        serializer.enqueue("blocked", async move {
            let _ = release_rx.await;
            Ok(())
        });
        let counter = other_done.clone();
        serializer.enqueue("free", async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        serializer.flush("free").await;

        assert_eq!(other_done.load(Ordering::SeqCst), 1);
        assert!(serializer.is_busy("blocked"));
        let _ = release_tx.send(());
        serializer.flush("blocked").await;
    }

    #[tokio::test]
    async fn test_chain_is_dropped_when_drained() {
        let serializer = NotificationSerializer::new();
        serializer.enqueue("parent", async { Ok(()) });
        serializer.flush("parent").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!serializer.is_busy("parent"));
    }
}
