//! Sliding-window time aggregation per owner module
//!
//! Each module owns a queue of `(completion timestamp, duration)` entries and
//! a running total. Writers append at the tail; readers evict expired entries
//! from the head before returning the total. There is no background sweeper:
//! a module that is never read keeps growing until the next read, which the
//! reporter bounds by reading every module at a fixed cadence.
//!
//! # Concurrency
//!
//! Completed calls arrive from any host thread while the reporter reads on
//! its own thread. Every module's aggregate sits behind its own `Mutex`, and
//! the module map behind an `RwLock` that is only write-locked the first time
//! a module is seen (and on `clear`). The map is never handed out, so every
//! access goes through `record`/`read`.

use crate::module::ModuleId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// Default window length
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// One completed outer call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    pub timestamp: Duration,
    pub duration: Duration,
}

/// Queue plus running total for a single module
///
/// `total` always equals the sum of `entries[*].duration`.
#[derive(Debug, Default)]
struct WindowAggregate {
    entries: VecDeque<WindowEntry>,
    total: Duration,
}

impl WindowAggregate {
    fn push(&mut self, entry: WindowEntry) {
        self.total += entry.duration;
        self.entries.push_back(entry);
    }

    fn evict(&mut self, now: Duration, window: Duration) {
        while let Some(front) = self.entries.front() {
            if now.saturating_sub(front.timestamp) <= window {
                break;
            }
            let expired = self.entries.pop_front();
            if let Some(expired) = expired {
                self.total = self.total.saturating_sub(expired.duration);
            }
        }
    }
}

/// Per-module rolling totals shared across threads
#[derive(Debug)]
pub struct SlidingWindowAggregator {
    window: Duration,
    modules: RwLock<HashMap<ModuleId, Arc<Mutex<WindowAggregate>>>>,
}

fn lock(aggregate: &Mutex<WindowAggregate>) -> MutexGuard<'_, WindowAggregate> {
    // push/evict update the queue and the total together
    aggregate.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SlidingWindowAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            modules: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn aggregate(&self, module: &ModuleId) -> Arc<Mutex<WindowAggregate>> {
        {
            let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = modules.get(module) {
                return Arc::clone(existing);
            }
        }
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(modules.entry(module.clone()).or_default())
    }

    /// Append a completed call
    pub fn record(&self, module: &ModuleId, timestamp: Duration, duration: Duration) {
        let aggregate = self.aggregate(module);
        lock(&aggregate).push(WindowEntry {
            timestamp,
            duration,
        });
    }

    /// Evict expired entries and return the module's total over the window
    ///
    /// Unknown modules read as zero.
    ///
    /// # Example
    /// ```
    /// use modperf::module::ModuleId;
    /// use modperf::window::SlidingWindowAggregator;
    /// use std::time::Duration;
    ///
    /// let agg = SlidingWindowAggregator::new(Duration::from_secs(10));
    /// let a = ModuleId::in_memory("A");
    /// agg.record(&a, Duration::from_secs(0), Duration::from_millis(5));
    /// agg.record(&a, Duration::from_secs(3), Duration::from_millis(5));
    /// assert_eq!(agg.read(&a, Duration::from_secs(4)), Duration::from_millis(10));
    /// assert_eq!(agg.read(&a, Duration::from_secs(11)), Duration::from_millis(5));
    /// ```
    pub fn read(&self, module: &ModuleId, now: Duration) -> Duration {
        let aggregate = {
            let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
            match modules.get(module) {
                Some(aggregate) => Arc::clone(aggregate),
                None => return Duration::ZERO,
            }
        };
        let mut guard = lock(&aggregate);
        guard.evict(now, self.window);
        guard.total
    }

    /// Read every known module
    pub fn read_all(&self, now: Duration) -> Vec<(ModuleId, Duration)> {
        let aggregates: Vec<(ModuleId, Arc<Mutex<WindowAggregate>>)> = {
            let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
            modules
                .iter()
                .map(|(id, agg)| (id.clone(), Arc::clone(agg)))
                .collect()
        };

        aggregates
            .into_iter()
            .map(|(id, aggregate)| {
                let mut guard = lock(&aggregate);
                guard.evict(now, self.window);
                (id, guard.total)
            })
            .collect()
    }

    /// Entries currently queued for a module (evicted or not)
    pub fn entry_count(&self, module: &ModuleId) -> usize {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        modules
            .get(module)
            .map(|aggregate| lock(aggregate).entries.len())
            .unwrap_or(0)
    }

    /// Forget every module
    pub fn clear(&self) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[cfg(test)]
    fn queued_sum(&self, module: &ModuleId) -> (Duration, Duration) {
        let aggregate = self.aggregate(module);
        let guard = lock(&aggregate);
        let sum = guard.entries.iter().map(|e| e.duration).sum();
        (guard.total, sum)
    }
}

impl Default for SlidingWindowAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
