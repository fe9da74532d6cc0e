//! Keyed admission control.
//!
//! Each concurrency key owns a held-slot count and a FIFO of waiters.
//! A release hands the slot straight to the oldest live waiter without
//! touching the count; only when nobody is waiting does the count drop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::BackgroundTaskConfig;

/// Limit used when nothing is configured for a key.
pub const FALLBACK_LIMIT: usize = 5;

/// Resolved admission limit for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyLimit {
    Bounded(usize),
    Unlimited,
}

impl ConcurrencyLimit {
    /// A configured value of 0 means unlimited.
    pub const fn from_configured(value: usize) -> Self {
        if value == 0 {
            Self::Unlimited
        } else {
            Self::Bounded(value)
        }
    }
}

impl std::fmt::Display for ConcurrencyLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bounded(limit) => write!(f, "{limit}"),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

const WAITER_PENDING: u8 = 0;
const WAITER_RESOLVED: u8 = 1;
const WAITER_CANCELLED: u8 = 2;

/// Terminal state of a queued admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterState {
    Pending,
    Resolved,
    Cancelled,
}

/// Single compare-and-set cell; exactly one of resolve/cancel ever wins.
#[derive(Debug)]
struct WaiterCell(AtomicU8);

impl WaiterCell {
    fn new() -> Self {
        Self(AtomicU8::new(WAITER_PENDING))
    }

    fn settle(&self, to: u8) -> bool {
        self.0
            .compare_exchange(WAITER_PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn load(&self) -> WaiterState {
        match self.0.load(Ordering::Acquire) {
            WAITER_PENDING => WaiterState::Pending,
            WAITER_RESOLVED => WaiterState::Resolved,
            _ => WaiterState::Cancelled,
        }
    }
}

struct Waiter {
    id: u64,
    cell: Arc<WaiterCell>,
    tx: oneshot::Sender<DomainResult<()>>,
}

impl Waiter {
    fn resolve(self) -> bool {
        self.cell.settle(WAITER_RESOLVED) && self.tx.send(Ok(())).is_ok()
    }

    fn cancel(self, key: &str) -> bool {
        if !self.cell.settle(WAITER_CANCELLED) {
            return false;
        }
        let _ = self.tx.send(Err(DomainError::AdmissionCancelled {
            key: key.to_string(),
        }));
        true
    }
}

#[derive(Default)]
struct GateState {
    counts: HashMap<String, usize>,
    waiters: HashMap<String, VecDeque<Waiter>>,
}

impl GateState {
    fn release(&mut self, key: &str) {
        if let Some(queue) = self.waiters.get_mut(key) {
            while let Some(waiter) = queue.pop_front() {
                let id = waiter.id;
                if waiter.resolve() {
                    trace!(key = %key, waiter = id, "slot handed to queued waiter");
                    if queue.is_empty() {
                        self.waiters.remove(key);
                    }
                    return;
                }
            }
            self.waiters.remove(key);
        }

        if let Some(count) = self.counts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(key);
            }
        }
    }

    fn cancel_waiters(&mut self, key: &str) -> usize {
        let Some(queue) = self.waiters.remove(key) else {
            return 0;
        };
        queue
            .into_iter()
            .map(|waiter| waiter.cancel(key))
            .filter(|cancelled| *cancelled)
            .count()
    }
}

/// Per-key counting admission gate with FIFO waiters.
pub struct ConcurrencyGate {
    model_limits: HashMap<String, usize>,
    provider_limits: HashMap<String, usize>,
    default_limit: Option<usize>,
    state: Mutex<GateState>,
    next_waiter: AtomicU64,
}

impl ConcurrencyGate {
    pub fn new(config: &BackgroundTaskConfig) -> Self {
        Self {
            model_limits: config.model_concurrency.clone(),
            provider_limits: config.provider_concurrency.clone(),
            default_limit: config.default_concurrency,
            state: Mutex::new(GateState::default()),
            next_waiter: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the limit for a key.
    ///
    /// Exact key override, then prefix group (text before the first `/`),
    /// then the global default, then [`FALLBACK_LIMIT`].
    pub fn limit(&self, key: &str) -> ConcurrencyLimit {
        if let Some(&limit) = self.model_limits.get(key) {
            return ConcurrencyLimit::from_configured(limit);
        }
        let provider = key.split('/').next().unwrap_or(key);
        if let Some(&limit) = self.provider_limits.get(provider) {
            return ConcurrencyLimit::from_configured(limit);
        }
        if let Some(limit) = self.default_limit {
            return ConcurrencyLimit::from_configured(limit);
        }
        ConcurrencyLimit::Bounded(FALLBACK_LIMIT)
    }

    /// Wait for a slot under `key`.
    ///
    /// Unlimited keys return immediately without bookkeeping. A queued
    /// request fails with [`DomainError::AdmissionCancelled`] if the key's
    /// waiters are cancelled. Dropping the returned future gives back a slot
    /// that was handed to it but never observed.
    pub async fn acquire(&self, key: &str) -> DomainResult<()> {
        let ConcurrencyLimit::Bounded(max) = self.limit(key) else {
            return Ok(());
        };

        let mut admission = {
            let mut state = self.state();
            let count = state.counts.entry(key.to_string()).or_insert(0);
            if *count < max {
                *count += 1;
                trace!(key = %key, held = *count, limit = max, "slot acquired");
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let cell = Arc::new(WaiterCell::new());
            state
                .waiters
                .entry(key.to_string())
                .or_default()
                .push_back(Waiter {
                    id,
                    cell: cell.clone(),
                    tx,
                });
            debug!(key = %key, waiter = id, limit = max, "slot unavailable, queued");
            PendingAdmission {
                gate: self,
                key: key.to_string(),
                id,
                cell,
                rx,
                settled: false,
            }
        };

        let outcome = (&mut admission.rx).await;
        admission.settled = true;
        outcome.unwrap_or_else(|_| {
            Err(DomainError::AdmissionCancelled {
                key: key.to_string(),
            })
        })
    }

    /// Give a slot back, preferring a direct handoff to the oldest waiter.
    ///
    /// Releasing a key with nothing held is a no-op.
    pub fn release(&self, key: &str) {
        self.state().release(key);
    }

    /// Reject every queued waiter for `key`. The held count is untouched.
    pub fn cancel_waiters(&self, key: &str) -> usize {
        let cancelled = self.state().cancel_waiters(key);
        if cancelled > 0 {
            debug!(key = %key, cancelled, "cancelled queued waiters");
        }
        cancelled
    }

    /// Reject all waiters on every key and reset every count.
    pub fn clear(&self) {
        let mut state = self.state();
        let keys: Vec<String> = state.waiters.keys().cloned().collect();
        for key in keys {
            state.cancel_waiters(&key);
        }
        state.counts.clear();
    }

    /// Slots currently held under `key`.
    pub fn count(&self, key: &str) -> usize {
        self.state().counts.get(key).copied().unwrap_or(0)
    }

    /// Live waiters queued under `key`.
    pub fn queue_len(&self, key: &str) -> usize {
        self.state().waiters.get(key).map_or(0, |queue| {
            queue
                .iter()
                .filter(|w| w.cell.load() == WaiterState::Pending)
                .count()
        })
    }
}

/// A queued acquire in flight. Owns the receiving end so a handoff that
/// races with the caller going away is returned to the gate.
struct PendingAdmission<'a> {
    gate: &'a ConcurrencyGate,
    key: String,
    id: u64,
    cell: Arc<WaiterCell>,
    rx: oneshot::Receiver<DomainResult<()>>,
    settled: bool,
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.gate.state();
        if self.cell.settle(WAITER_CANCELLED) {
            if let Some(queue) = state.waiters.get_mut(&self.key) {
                queue.retain(|w| w.id != self.id);
                if queue.is_empty() {
                    state.waiters.remove(&self.key);
                }
            }
        } else if self.cell.load() == WaiterState::Resolved {
            if let Ok(Ok(())) = self.rx.try_recv() {
                debug!(key = %self.key, waiter = self.id, "returning unobserved handoff");
                state.release(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    fn gate_with(configure: impl FnOnce(&mut BackgroundTaskConfig)) -> Arc<ConcurrencyGate> {
        let mut config = BackgroundTaskConfig::default();
        configure(&mut config);
        Arc::new(ConcurrencyGate::new(&config))
    }

    #[test]
    fn test_limit_resolution_order() {
        let gate = gate_with(|c| {
            c.model_concurrency.insert("anthropic/opus".to_string(), 1);
            c.provider_concurrency.insert("anthropic".to_string(), 3);
            c.default_concurrency = Some(7);
        });
        assert_eq!(gate.limit("anthropic/opus"), ConcurrencyLimit::Bounded(1));
        assert_eq!(gate.limit("anthropic/sonnet"), ConcurrencyLimit::Bounded(3));
        assert_eq!(gate.limit("openai/gpt"), ConcurrencyLimit::Bounded(7));
    }

    #[test]
    fn test_limit_fallback_and_unlimited() {
        let gate = gate_with(|c| {
            c.provider_concurrency.insert("local".to_string(), 0);
        });
        assert_eq!(gate.limit("explore"), ConcurrencyLimit::Bounded(FALLBACK_LIMIT));
        assert_eq!(gate.limit("local/llama"), ConcurrencyLimit::Unlimited);
    }

    #[tokio::test]
    async fn test_handoff_keeps_count() {
        let gate = gate_with(|c| {
            c.model_concurrency.insert("m1".to_string(), 1);
        });
        gate.acquire("m1").await.unwrap();
        assert_eq!(gate.count("m1"), 1);

        let waiting = tokio::spawn({
            let gate = gate.clone();
            async move { gate.acquire("m1").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.queue_len("m1"), 1);

        gate.release("m1");
        waiting.await.unwrap().unwrap();
        assert_eq!(gate.count("m1"), 1);
        assert_eq!(gate.queue_len("m1"), 0);

        gate.release("m1");
        assert_eq!(gate.count("m1"), 0);
    }

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let gate = gate_with(|c| c.default_concurrency = Some(0));
        for _ in 0..1000 {
            gate.acquire("anything").await.unwrap();
        }
        assert_eq!(gate.count("anything"), 0);
    }

    #[test]
    fn test_release_without_acquire_stays_zero() {
        let gate = gate_with(|_| {});
        gate.release("ghost");
        gate.release("ghost");
        assert_eq!(gate.count("ghost"), 0);
    }

    #[tokio::test]
    async fn test_cancel_waiters_rejects_queue_only() {
        let gate = gate_with(|c| c.default_concurrency = Some(1));
        gate.acquire("k").await.unwrap();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.acquire("k").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(gate.cancel_waiters("k"), 3);
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_admission_cancelled());
        }
        assert_eq!(gate.count("k"), 1);
        assert_eq!(gate.cancel_waiters("k"), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_skipped() {
        let gate = gate_with(|c| c.default_concurrency = Some(1));
        gate.acquire("k").await.unwrap();

        let mut abandoned = Box::pin(gate.acquire("k"));
        assert!((&mut abandoned).now_or_never().is_none());
        assert_eq!(gate.queue_len("k"), 1);
        drop(abandoned);
        assert_eq!(gate.queue_len("k"), 0);

        gate.release("k");
        assert_eq!(gate.count("k"), 0);
    }

    #[tokio::test]
    async fn test_unobserved_handoff_is_returned() {
        let gate = gate_with(|c| c.default_concurrency = Some(1));
        gate.acquire("k").await.unwrap();

        let mut first = Box::pin(gate.acquire("k"));
        assert!((&mut first).now_or_never().is_none());
        let second = tokio::spawn({
            let gate = gate.clone();
            async move { gate.acquire("k").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.release("k");
        drop(first);

        second.await.unwrap().unwrap();
        assert_eq!(gate.count("k"), 1);
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let gate = gate_with(|c| c.default_concurrency = Some(1));
        gate.acquire("a").await.unwrap();
        gate.acquire("b").await.unwrap();
        let waiting = tokio::spawn({
            let gate = gate.clone();
            async move { gate.acquire("a").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.clear();
        assert!(waiting.await.unwrap().is_err());
        assert_eq!(gate.count("a"), 0);
        assert_eq!(gate.count("b"), 0);
    }
}
