//! Named, cancellable delayed callbacks.
//!
//! At most one timer is pending per key. Each armed timer carries a generation
//! number and a [`CancellationToken`]. When the delay elapses, the timer task
//! removes its entry only if the generation still matches, and runs the
//! callback only if that removal succeeded. Cancellation removes the entry in
//! the same map critical section, so once `cancel` returns, a callback that has
//! not already claimed its entry will never start.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    token: CancellationToken,
}

/// Registry of pending timers keyed by `K`.
pub struct TimerRegistry<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    entries: Arc<DashMap<K, TimerEntry>>,
    next_generation: AtomicU64,
    name: &'static str,
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    /// Create an empty registry. `name` labels logs and metrics.
    pub fn new(name: &'static str) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            name,
        }
    }

    /// Arm a timer for `key`, replacing any timer already pending for it.
    ///
    /// Replacement happens under the key's map lock, so there is never a moment
    /// where two timers are armed for the same key.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let previous = self.entries.insert(
            key.clone(),
            TimerEntry {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
            debug!(registry = self.name, key = %key, "Replaced pending timer");
        }
        self.record_pending();

        let entries = Arc::clone(&self.entries);
        let name = self.name;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(registry = name, key = %key, "Timer cancelled before firing");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let claimed = entries
                .remove_if(&key, |_, entry| entry.generation == generation)
                .is_some();
            gauge!("pulse_timers_pending", "registry" => name).set(entries.len() as f64);

            if claimed {
                debug!(registry = name, key = %key, "Timer fired");
                callback().await;
            } else {
                trace!(registry = name, key = %key, "Timer superseded before firing");
            }
        });
    }

    /// Cancel the pending timer for `key`. Returns whether one was pending.
    ///
    /// Idempotent. A callback that already started is allowed to finish.
    pub fn cancel(&self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.token.cancel();
                self.record_pending();
                debug!(registry = self.name, key = %key, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel and drop every trace of `key`, for keys whose owner is gone.
    pub fn cancel_and_purge(&self, key: &K) {
        self.cancel(key);
        self.entries.shrink_to_fit();
    }

    /// Whether a timer is armed for `key`.
    pub fn is_pending(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of armed timers.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) {
        self.entries.retain(|_, entry| {
            entry.token.cancel();
            false
        });
        self.record_pending();
    }

    fn record_pending(&self) {
        gauge!("pulse_timers_pending", "registry" => self.name).set(self.entries.len() as f64);
    }
}
