//! Busy-poll backoff for producers waiting on the host
//!
//! There is no blocking primitive across the device/host boundary, so every
//! wait is a poll. Spins double up to a cap, then the thread yields between
//! polls. An optional poll limit turns an indefinite wait into a give-up.

use std::cell::Cell;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

#[derive(Debug)]
pub struct Backoff {
    step: Cell<u32>,
    polls: Cell<u64>,
    limit: Option<u64>,
}

impl Backoff {
    /// Backoff that never gives up.
    pub fn new() -> Self {
        Self {
            step: Cell::new(0),
            polls: Cell::new(0),
            limit: None,
        }
    }

    /// Backoff that reports exhaustion after `max_polls` snoozes.
    pub fn with_limit(max_polls: u64) -> Self {
        Self {
            limit: Some(max_polls),
            ..Self::new()
        }
    }

    /// Short wait after a lost CAS race.
    pub fn spin(&self) {
        for _ in 0..1u32 << self.step.get().min(SPIN_LIMIT) {
            std::hint::spin_loop();
        }
        if self.step.get() <= SPIN_LIMIT {
            self.step.set(self.step.get() + 1);
        }
    }

    /// Wait for another party (the host, or a producer mid-publish).
    pub fn snooze(&self) {
        if self.step.get() <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step.get() {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        if self.step.get() <= YIELD_LIMIT {
            self.step.set(self.step.get() + 1);
        }
        self.polls.set(self.polls.get() + 1);
    }

    pub fn polls(&self) -> u64 {
        self.polls.get()
    }

    pub fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.polls.get() >= limit)
    }

    pub fn reset(&self) {
        self.step.set(0);
        self.polls.set(0);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
