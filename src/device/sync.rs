//! Mutex-guarded bounded counters.
//!
//! All cross-core coordination is built from two operations over the shared
//! control counters: a bounded increment and a bounded decrement, both
//! returning the pre-modification value. One mutex serializes exactly these
//! counters; no other shared state is ever mutated concurrently.
//!
//! The contract under concurrent callers:
//!
//! - each value strictly inside the bound is returned to at most one caller
//!   (claim uniqueness, which is what makes task claims exactly-once), and
//! - once the counter saturates at the bound, every further call returns the
//!   bound unmodified, which callers read as "no more work" / "no more
//!   slots".
//!
//! Waiters spin; the cores have nothing else to run and nothing to yield to.

use std::sync::Mutex;

/// The four concurrently-mutated control counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    /// Next task index to hand out; saturates at `task_count`.
    TaskToTake,
    /// Number of completed tasks; saturates at `task_count`.
    TaskFinished,
    /// Execution slots granted to cores; saturates at zero when drained.
    StartCores,
    /// Next free per-core timer slot.
    TimerIndex,
}

#[derive(Debug, Default)]
struct ControlInfo {
    task_count: i32,
    task_to_take: i32,
    task_finished: i32,
    start_cores: i32,
    timer_index: i32,
}

impl ControlInfo {
    fn slot(&mut self, counter: Counter) -> &mut i32 {
        match counter {
            Counter::TaskToTake => &mut self.task_to_take,
            Counter::TaskFinished => &mut self.task_finished,
            Counter::StartCores => &mut self.start_cores,
            Counter::TimerIndex => &mut self.timer_index,
        }
    }
}

/// The shared control counters behind their single mutex.
#[derive(Debug, Default)]
pub struct CounterBank {
    inner: Mutex<ControlInfo>,
}

impl CounterBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of tasks in the batch. Written once by the host before
    /// any core is released; read-only afterwards.
    pub fn set_task_count(&self, count: i32) {
        self.inner.lock().unwrap().task_count = count;
    }

    pub fn task_count(&self) -> i32 {
        self.inner.lock().unwrap().task_count
    }

    /// Atomically step `counter` up by one if it is strictly below `max`.
    /// Returns the pre-modification value in either case.
    pub fn bounded_increment(&self, counter: Counter, max: i32) -> i32 {
        let mut info = self.inner.lock().unwrap();
        let current = *info.slot(counter);
        if current < max {
            *info.slot(counter) = current + 1;
        }
        current
    }

    /// Atomically step `counter` down by one if it is strictly above `min`.
    /// Returns the pre-modification value in either case.
    pub fn bounded_decrement(&self, counter: Counter, min: i32) -> i32 {
        let mut info = self.inner.lock().unwrap();
        let current = *info.slot(counter);
        if current > min {
            *info.slot(counter) = current - 1;
        }
        current
    }

    /// Read a counter without modifying it (host-side polling).
    pub fn load(&self, counter: Counter) -> i32 {
        *self.inner.lock().unwrap().slot(counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_increment_saturates_at_bound() {
        let bank = CounterBank::new();
        assert_eq!(bank.bounded_increment(Counter::TaskToTake, 2), 0);
        assert_eq!(bank.bounded_increment(Counter::TaskToTake, 2), 1);
        // Saturated: the bound is returned, unmodified, forever after.
        assert_eq!(bank.bounded_increment(Counter::TaskToTake, 2), 2);
        assert_eq!(bank.bounded_increment(Counter::TaskToTake, 2), 2);
        assert_eq!(bank.load(Counter::TaskToTake), 2);
    }

    #[test]
    fn test_decrement_saturates_at_bound() {
        let bank = CounterBank::new();
        bank.bounded_increment(Counter::StartCores, 2);
        bank.bounded_increment(Counter::StartCores, 2);
        assert_eq!(bank.bounded_decrement(Counter::StartCores, 0), 2);
        assert_eq!(bank.bounded_decrement(Counter::StartCores, 0), 1);
        assert_eq!(bank.bounded_decrement(Counter::StartCores, 0), 0);
        assert_eq!(bank.bounded_decrement(Counter::StartCores, 0), 0);
    }

    #[test]
    fn test_concurrent_claims_are_unique_and_in_range() {
        const CLAIMS: i32 = 500;
        const THREADS: usize = 8;

        let bank = Arc::new(CounterBank::new());
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let bank = Arc::clone(&bank);
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                loop {
                    let value = bank.bounded_increment(Counter::TaskToTake, CLAIMS);
                    if value >= CLAIMS {
                        break;
                    }
                    claimed.push(value);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!((0..CLAIMS).contains(&value));
                // Claim uniqueness: no index is handed out twice.
                assert!(seen.insert(value));
            }
        }
        assert_eq!(seen.len(), CLAIMS as usize);
    }

    #[test]
    fn test_concurrent_slot_drain() {
        const SLOTS: i32 = 6;
        let bank = Arc::new(CounterBank::new());
        for _ in 0..SLOTS {
            bank.bounded_increment(Counter::StartCores, SLOTS);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let bank = Arc::clone(&bank);
            handles.push(std::thread::spawn(move || {
                let mut grants = 0;
                while bank.bounded_decrement(Counter::StartCores, 0) > 0 {
                    grants += 1;
                }
                grants
            }));
        }

        let total: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, SLOTS);
        assert_eq!(bank.load(Counter::StartCores), 0);
    }
}
