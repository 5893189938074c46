//! Single-flight dispatch for readiness events.
//!
//! Edge-triggered readiness can fire again for a descriptor while an
//! earlier task for it is still queued or running. Each event source owns
//! a `SingleFlight` gate so at most one task per descriptor is ever in the
//! pool. An event that arrives while a task is active marks the gate
//! notified instead; the active task then drains once more before the gate
//! goes idle, so no readiness edge is lost.

use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;

const IDLE: u8 = 0;
/// A task is queued or running.
const SCHEDULED: u8 = 1;
/// A task is running and another event arrived since its drain started.
const NOTIFIED: u8 = 2;

#[derive(Debug, Default)]
pub struct SingleFlight {
    state: AtomicU8,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Record a readiness event.
    ///
    /// Returns true when the caller must submit a task; false when an
    /// active task will observe the event instead.
    pub fn schedule(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                SCHEDULED => NOTIFIED,
                _ => return false,
            };
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current == IDLE,
                Err(actual) => current = actual,
            }
        }
    }

    /// Run `drain` until no event arrived during the last pass.
    ///
    /// `drain` returns false when the source is gone (connection closed);
    /// the gate then stays scheduled so no further task is ever submitted
    /// for it. If `drain` panics the gate is released, so the next
    /// readiness event schedules a fresh task.
    pub fn run<F>(&self, mut drain: F)
    where
        F: FnMut() -> bool,
    {
        let _release = ReleaseOnUnwind(&self.state);
        loop {
            // Events from here on are covered by the pass below
            self.state.store(SCHEDULED, Ordering::Release);
            if !drain() {
                return;
            }
            if self
                .state
                .compare_exchange(SCHEDULED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Whether a task is currently queued or running.
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) != IDLE
    }
}

/// Returns the gate to idle when a drain pass unwinds.
struct ReleaseOnUnwind<'a>(&'a AtomicU8);

impl Drop for ReleaseOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(IDLE, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_first_event_schedules() {
        let gate = SingleFlight::new();
        assert!(!gate.is_active());
        assert!(gate.schedule());
        assert!(gate.is_active());
        assert!(!gate.schedule());
        assert!(!gate.schedule());
    }

    #[test]
    fn test_run_goes_idle() {
        let gate = SingleFlight::new();
        assert!(gate.schedule());

        let mut passes = 0;
        gate.run(|| {
            passes += 1;
            true
        });
        assert_eq!(passes, 1);
        assert!(!gate.is_active());
        assert!(gate.schedule());
    }

    #[test]
    fn test_event_during_drain_reruns() {
        let gate = SingleFlight::new();
        assert!(gate.schedule());

        let mut passes = 0;
        gate.run(|| {
            passes += 1;
            if passes == 1 {
                // A second edge while the first drain is in progress
                assert!(!gate.schedule());
            }
            true
        });
        assert_eq!(passes, 2);
        assert!(!gate.is_active());
    }

    #[test]
    fn test_closed_source_stays_scheduled() {
        let gate = SingleFlight::new();
        assert!(gate.schedule());
        gate.run(|| false);
        assert!(gate.is_active());
        assert!(!gate.schedule());
    }

    #[test]
    fn test_panicking_drain_releases_gate() {
        let gate = SingleFlight::new();
        assert!(gate.schedule());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            gate.run(|| panic!("drain failed"));
        }));
        assert!(result.is_err());
        assert!(!gate.is_active());

        // The next event must reach a worker again
        assert!(gate.schedule());
        let mut passes = 0;
        gate.run(|| {
            passes += 1;
            true
        });
        assert_eq!(passes, 1);
        assert!(!gate.is_active());
    }

    #[test]
    fn test_never_two_runners() {
        let gate = Arc::new(SingleFlight::new());
        let running = Arc::new(AtomicUsize::new(0));
        let passes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let running = Arc::clone(&running);
                let passes = Arc::clone(&passes);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if gate.schedule() {
                            gate.run(|| {
                                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                                passes.fetch_add(1, Ordering::SeqCst);
                                running.fetch_sub(1, Ordering::SeqCst);
                                true
                            });
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(!gate.is_active());
        assert!(passes.load(Ordering::SeqCst) >= 1);
    }
}
