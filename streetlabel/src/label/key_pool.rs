use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::LabelError;

/// A key handed out by [`ApiKeyPool::select`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLease<'a> {
    pub index: usize,
    pub key: &'a str,
}

/// API keys with per-key request counters.
///
/// Selection is greedy: the key with the lowest load (recorded requests plus
/// requests still in flight) wins, ties go to the lowest index. Selecting a key
/// reserves it until [`ApiKeyPool::record_use`] is called for that request. A key
/// whose counter reaches the threshold is paused for a fixed time and its counter
/// reset. Counters live only for the lifetime of the pool.
pub struct ApiKeyPool {
    keys: Vec<String>,
    counters: Vec<AtomicUsize>,
    /// Selected but not yet recorded, per key
    in_flight: Vec<AtomicUsize>,
    /// Makes "find least loaded, then reserve it" one step
    select_lock: Mutex<()>,
    threshold: usize,
    pause: Duration,
}

impl ApiKeyPool {
    pub fn new(keys: Vec<String>, threshold: usize, pause: Duration) -> Result<Self, LabelError> {
        if keys.is_empty() {
            return Err(LabelError::EmptyKeyPool);
        }
        let counters = keys.iter().map(|_| AtomicUsize::new(0)).collect();
        let in_flight = keys.iter().map(|_| AtomicUsize::new(0)).collect();
        Ok(ApiKeyPool {
            keys,
            counters,
            in_flight,
            select_lock: Mutex::new(()),
            threshold: threshold.max(1),
            pause,
        })
    }

    pub fn from_config(keys: Vec<String>, config: &PipelineConfig) -> Result<Self, LabelError> {
        Self::new(keys, config.key_threshold, config.key_pause())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Pick the least loaded key and reserve it for one request
    pub fn select(&self) -> KeyLease<'_> {
        // The guarded data is `()`, a poisoned lock carries no broken state
        let _guard = self
            .select_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let index = (0..self.keys.len())
            .min_by_key(|&i| self.load(i))
            .unwrap_or(0);
        self.in_flight[index].fetch_add(1, Ordering::SeqCst);

        debug!(key_index = index, "Selected API key");
        KeyLease {
            index,
            key: &self.keys[index],
        }
    }

    /// Count one finished request against key `index` and release its reservation.
    /// Returns `true` when the key hit the threshold, was paused and reset.
    pub fn record_use(&self, index: usize) -> bool {
        // Saturating: a use recorded without a prior `select` has nothing to release
        let _ = self.in_flight[index].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        });
        let count = self.counters[index].fetch_add(1, Ordering::SeqCst) + 1;
        if count < self.threshold {
            return false;
        }

        info!(
            "Pausing for API key {} after {} requests ({:?})",
            index, count, self.pause
        );
        std::thread::sleep(self.pause);
        self.counters[index].store(0, Ordering::SeqCst);
        true
    }

    pub fn count(&self, index: usize) -> usize {
        self.counters[index].load(Ordering::SeqCst)
    }

    pub fn in_flight(&self, index: usize) -> usize {
        self.in_flight[index].load(Ordering::SeqCst)
    }

    fn load(&self, index: usize) -> usize {
        self.count(index) + self.in_flight(index)
    }
}
