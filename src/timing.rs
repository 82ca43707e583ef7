//! Per-thread timing sessions keyed by owner module
//!
//! A host thread that calls into a module starts that module's session on
//! the way in and stops it on the way out. Only the outermost call toggles
//! the session: nested or recursive calls into the same module on the same
//! thread deepen a counter instead of restarting the timer, so a call tree
//! five levels deep still produces exactly one completed timing.
//!
//! Sessions live in `thread_local!` storage and never cross threads, so no
//! locking is needed here. Several stores can coexist in one process (one per
//! controller); each store has its own id and the thread-local map is keyed
//! by `(store id, module)`.
//!
//! `reset()` cannot reach into other threads' storage. Instead it bumps the
//! store generation; a session from an older generation is treated as idle
//! the next time its thread touches it. A post-call that straddles a reset
//! therefore finds a stale session and is dropped.
//!
//! Dropping a store works the same way: the dropping thread clears its own
//! entries, and every other thread prunes entries of dead stores on its next
//! `start` after a drop.

use crate::module::ModuleId;
use fnv::{FnvHashMap, FnvHashSet};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

type Sessions = FnvHashMap<(u64, ModuleId), TimingSession>;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Bumped every time a store is dropped
static DROPPED_STORES: AtomicU64 = AtomicU64::new(0);

fn live_stores() -> &'static Mutex<FnvHashSet<u64>> {
    static LIVE: OnceLock<Mutex<FnvHashSet<u64>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(FnvHashSet::default()))
}

thread_local! {
    static SESSIONS: RefCell<Sessions> = RefCell::new(FnvHashMap::default());
    /// `DROPPED_STORES` as of this thread's last prune
    static SEEN_DROPS: Cell<u64> = const { Cell::new(0) };
}

/// Forget sessions of stores dropped since this thread last looked
fn prune_dropped(sessions: &mut Sessions) {
    let dropped = DROPPED_STORES.load(Ordering::Acquire);
    if SEEN_DROPS.get() == dropped {
        return;
    }
    SEEN_DROPS.set(dropped);
    let live = live_stores().lock().unwrap_or_else(PoisonError::into_inner);
    sessions.retain(|(store, _), _| live.contains(store));
}

/// Reusable timer for one (thread, module) pair
#[derive(Debug, Clone, Copy, Default)]
struct TimingSession {
    running: bool,
    started: Duration,
    depth: u32,
    generation: u64,
}

impl TimingSession {
    fn reset(&mut self, generation: u64) {
        *self = TimingSession {
            generation,
            ..TimingSession::default()
        };
    }
}

/// Result of a post-call on the timing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The outermost call finished after this long
    Completed(Duration),
    /// An inner call finished; the session keeps running
    Nested,
    /// No running session to stop
    Mismatch,
}

/// Handle onto this process's per-thread timing sessions
#[derive(Debug)]
pub struct TimingSessionStore {
    id: u64,
    generation: AtomicU64,
}

impl TimingSessionStore {
    pub fn new() -> Self {
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        live_stores()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        Self {
            id,
            generation: AtomicU64::new(0),
        }
    }

    /// Pre-call: start the session unless it is already running
    ///
    /// Returns `true` when this call is the outermost one and started the
    /// timer.
    pub fn start(&self, module: &ModuleId, now: Duration) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        SESSIONS
            .try_with(|sessions| {
                let mut sessions = sessions.borrow_mut();
                prune_dropped(&mut sessions);
                let session = sessions.entry((self.id, module.clone())).or_default();
                if session.generation != generation {
                    session.reset(generation);
                }
                if session.running {
                    session.depth += 1;
                    return false;
                }
                session.reset(generation);
                session.running = true;
                session.started = now;
                session.depth = 1;
                true
            })
            // Thread is shutting down; nothing to time
            .unwrap_or(false)
    }

    /// Post-call: stop the session if this is the outermost call
    pub fn stop(&self, module: &ModuleId, now: Duration) -> StopOutcome {
        let generation = self.generation.load(Ordering::Acquire);
        SESSIONS
            .try_with(|sessions| {
                let mut sessions = sessions.borrow_mut();
                let Some(session) = sessions.get_mut(&(self.id, module.clone())) else {
                    return StopOutcome::Mismatch;
                };
                if session.generation != generation {
                    session.reset(generation);
                    return StopOutcome::Mismatch;
                }
                if !session.running {
                    return StopOutcome::Mismatch;
                }

                session.depth = session.depth.saturating_sub(1);
                if session.depth > 0 {
                    return StopOutcome::Nested;
                }
                session.running = false;
                StopOutcome::Completed(now.saturating_sub(session.started))
            })
            .unwrap_or(StopOutcome::Mismatch)
    }

    /// Whether this thread has a running session for `module`
    pub fn is_running(&self, module: &ModuleId) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        SESSIONS
            .try_with(|sessions| {
                sessions
                    .borrow()
                    .get(&(self.id, module.clone()))
                    .is_some_and(|s| s.running && s.generation == generation)
            })
            .unwrap_or(false)
    }

    /// Invalidate every thread's sessions
    ///
    /// The calling thread's entries are dropped right away; other threads
    /// notice the new generation on their next call.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let _ = SESSIONS.try_with(|sessions| {
            sessions.borrow_mut().retain(|(store, _), _| *store != self.id);
        });
    }
}

impl Default for TimingSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimingSessionStore {
    fn drop(&mut self) {
        live_stores()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        DROPPED_STORES.fetch_add(1, Ordering::AcqRel);
        let _ = SESSIONS.try_with(|sessions| {
            sessions.borrow_mut().retain(|(store, _), _| *store != self.id);
        });
    }
}

/// Number of sessions held by the calling thread, across all stores
#[cfg(test)]
fn thread_session_count() -> usize {
    SESSIONS.with(|sessions| sessions.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_start_stop_measures_elapsed() {
        let store = TimingSessionStore::new();
        let a = ModuleId::in_memory("A");

        assert!(store.start(&a, ms(100)));
        assert!(store.is_running(&a));
        assert_eq!(store.stop(&a, ms(130)), StopOutcome::Completed(ms(30)));
        assert!(!store.is_running(&a));
    }

    #[test]
    fn test_nested_calls_time_only_outermost() {
        let store = TimingSessionStore::new();
        let a = ModuleId::in_memory("A");

        assert!(store.start(&a, ms(0)));
        for depth in 1..5u64 {
            assert!(!store.start(&a, ms(depth)));
        }
        for depth in (1..5u64).rev() {
            assert_eq!(store.stop(&a, ms(10 + depth)), StopOutcome::Nested);
        }
        assert_eq!(store.stop(&a, ms(50)), StopOutcome::Completed(ms(50)));
    }

    #[test]
    fn test_stop_without_start_is_mismatch() {
        let store = TimingSessionStore::new();
        let a = ModuleId::in_memory("A");
        assert_eq!(store.stop(&a, ms(1)), StopOutcome::Mismatch);

        store.start(&a, ms(1));
        store.stop(&a, ms(2));
        assert_eq!(store.stop(&a, ms(3)), StopOutcome::Mismatch);
    }

    #[test]
    fn test_session_is_reused_after_stop() {
        let store = TimingSessionStore::new();
        let a = ModuleId::in_memory("A");

        store.start(&a, ms(0));
        assert_eq!(store.stop(&a, ms(4)), StopOutcome::Completed(ms(4)));
        assert!(store.start(&a, ms(10)));
        assert_eq!(store.stop(&a, ms(11)), StopOutcome::Completed(ms(1)));
    }

    #[test]
    fn test_modules_have_separate_sessions() {
        let store = TimingSessionStore::new();
        let a = ModuleId::in_memory("A");
        let b = ModuleId::in_memory("B");

        assert!(store.start(&a, ms(0)));
        assert!(store.start(&b, ms(5)));
        assert_eq!(store.stop(&b, ms(6)), StopOutcome::Completed(ms(1)));
        assert_eq!(store.stop(&a, ms(9)), StopOutcome::Completed(ms(9)));
    }

    #[test]
    fn test_reset_drops_in_flight_sessions() {
        let store = TimingSessionStore::new();
        let a = ModuleId::in_memory("A");

        store.start(&a, ms(0));
        store.reset();
        assert!(!store.is_running(&a));
        assert_eq!(store.stop(&a, ms(5)), StopOutcome::Mismatch);
    }

    #[test]
    fn test_reset_reaches_other_threads_lazily() {
        let store = Arc::new(TimingSessionStore::new());
        let a = ModuleId::in_memory("A");
        let started = Arc::new(Barrier::new(2));
        let reset_done = Arc::new(Barrier::new(2));

        let worker = {
            let store = Arc::clone(&store);
            let a = a.clone();
            let started = Arc::clone(&started);
            let reset_done = Arc::clone(&reset_done);
            std::thread::spawn(move || {
                assert!(store.start(&a, ms(0)));
                started.wait();
                reset_done.wait();
                store.stop(&a, ms(5))
            })
        };

        started.wait();
        store.reset();
        reset_done.wait();
        assert_eq!(worker.join().unwrap(), StopOutcome::Mismatch);
    }

    #[test]
    fn test_threads_do_not_share_sessions() {
        let store = Arc::new(TimingSessionStore::new());
        let a = ModuleId::in_memory("A");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2u64)
            .map(|i| {
                let store = Arc::clone(&store);
                let a = a.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    // Both threads are inside module A at the same time
                    let outermost = store.start(&a, ms(i * 100));
                    barrier.wait();
                    let outcome = store.stop(&a, ms(i * 100 + 7));
                    (outermost, outcome)
                })
            })
            .collect();

        for handle in handles {
            let (outermost, outcome) = handle.join().unwrap();
            assert!(outermost);
            assert_eq!(outcome, StopOutcome::Completed(ms(7)));
        }
    }

    #[test]
    fn test_dropped_store_sessions_pruned_on_other_threads() {
        use std::sync::mpsc;

        let (to_main, from_worker) = mpsc::channel::<Arc<TimingSessionStore>>();
        let dropped = Arc::new(Barrier::new(2));
        let worker = {
            let dropped = Arc::clone(&dropped);
            std::thread::spawn(move || {
                let first = Arc::new(TimingSessionStore::new());
                let a = ModuleId::in_memory("A");
                let b = ModuleId::in_memory("B");
                first.start(&a, ms(0));
                first.stop(&a, ms(1));
                first.start(&b, ms(2));
                let before = thread_session_count();

                // Last reference goes to the main thread, so the drop runs there
                to_main.send(first).unwrap();
                dropped.wait();

                let second = TimingSessionStore::new();
                assert!(second.start(&a, ms(3)));
                (before, thread_session_count())
            })
        };

        drop(from_worker.recv().unwrap());
        dropped.wait();

        let (before, after) = worker.join().unwrap();
        assert_eq!(before, 2);
        assert_eq!(after, 1);
    }

    #[test]
    fn test_stores_are_isolated_on_one_thread() {
        let first = TimingSessionStore::new();
        let second = TimingSessionStore::new();
        let a = ModuleId::in_memory("A");

        assert!(first.start(&a, ms(0)));
        assert!(second.start(&a, ms(2)));
        assert_eq!(second.stop(&a, ms(3)), StopOutcome::Completed(ms(1)));
        assert!(first.is_running(&a));
    }
}
