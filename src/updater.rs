//! The process-wide periodic updater: one thread driving every registered
//! session's flush on its own requested cadence. A bare `thread::spawn` +
//! `thread::sleep` loop walking every registered session and calling
//! `tick` on each, generalized from "every iteration, every session" to a
//! min/max cadence floor/ceiling so busy sessions flush sooner without
//! idle ones burning CPU.

use std::sync::{Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use crate::clock::now_ms;
use crate::consts::{UPDATER_CEIL_MS, UPDATER_FLOOR_MS};

/// Anything the updater can drive. [`Session`](crate::Session) is the only
/// implementor; the trait exists so `updater.rs` doesn't need to know about
/// sessions, FEC, or crypto.
pub(crate) trait Updatable: Send + Sync {
    /// Drives one flush at `now` (ms); returns the absolute ms timestamp
    /// this target next wants to be visited.
    fn tick(&self, now: u32) -> u32;
}

struct Entry {
    id: u64,
    target: Weak<dyn Updatable>,
    next: u32,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    next_id: u64,
}

pub(crate) struct Updater {
    state: Mutex<State>,
}

fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

impl Updater {
    /// The single process-wide instance, lazily starting its background
    /// thread on first access.
    pub(crate) fn global() -> &'static Updater {
        static INSTANCE: OnceLock<Updater> = OnceLock::new();
        static STARTED: OnceLock<()> = OnceLock::new();

        let updater = INSTANCE.get_or_init(|| Updater {
            state: Mutex::new(State::default()),
        });
        STARTED.get_or_init(|| {
            thread::spawn(run_loop);
        });
        updater
    }

    pub(crate) fn register(&self, target: Weak<dyn Updatable>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Entry {
            id,
            target,
            next: now_ms(),
        });
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.state.lock().unwrap().entries.retain(|e| e.id != id);
    }
}

fn run_loop() {
    let updater = Updater::global();
    loop {
        let now = now_ms();
        let mut sleep_ms = UPDATER_CEIL_MS;
        {
            let mut state = updater.state.lock().unwrap();
            state.entries.retain_mut(|entry| {
                let Some(target) = entry.target.upgrade() else {
                    return false;
                };
                if timediff(now, entry.next) >= 0 {
                    entry.next = target.tick(now);
                }
                let wait = timediff(entry.next, now);
                if wait > 0 {
                    sleep_ms = sleep_ms.min(wait as u64);
                }
                true
            });
        }
        thread::sleep(Duration::from_millis(sleep_ms.clamp(UPDATER_FLOOR_MS, UPDATER_CEIL_MS)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Counter(AtomicU32);
    impl Updatable for Counter {
        fn tick(&self, now: u32) -> u32 {
            self.0.fetch_add(1, Ordering::Relaxed);
            now.wrapping_add(10)
        }
    }

    #[test]
    fn registered_target_gets_ticked_and_unregister_stops_it() {
        let updater = Updater::global();
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        let id = updater.register(Arc::downgrade(&counter) as Weak<dyn Updatable>);

        thread::sleep(Duration::from_millis(150));
        let seen = counter.0.load(Ordering::Relaxed);
        assert!(seen > 0, "expected at least one tick, saw {seen}");

        updater.unregister(id);
        let after_unregister = counter.0.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(counter.0.load(Ordering::Relaxed), after_unregister);
    }

    #[test]
    fn dropped_target_is_pruned_without_explicit_unregister() {
        let updater = Updater::global();
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        updater.register(Arc::downgrade(&counter) as Weak<dyn Updatable>);
        drop(counter);
        thread::sleep(Duration::from_millis(150));
        // No panic / no leak is the property under test; entries self-prune
        // on the next tick once `upgrade()` fails.
    }
}
