// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};

///
/// Build counters, updated concurrently by the scheduler's workers. Counters are independent:
/// no ordering between them is promised, and a snapshot is only approximately consistent.
///
#[derive(Default, Debug)]
pub struct Statistics {
    actions_queued: AtomicUsize,
    actions_executed: AtomicUsize,
    actions_cached: AtomicUsize,
    actions_served: AtomicUsize,
    actions_flaky: AtomicUsize,
    actions_failed: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatisticsSnapshot {
    pub queued: usize,
    pub executed: usize,
    pub cached: usize,
    pub served: usize,
    pub flaky: usize,
    pub failed: usize,
}

impl Statistics {
    pub fn new() -> Statistics {
        Statistics::default()
    }

    pub fn increment_queued(&self) {
        self.actions_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_executed(&self) {
        self.actions_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cached(&self) {
        self.actions_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_served(&self) {
        self.actions_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_flaky(&self) {
        self.actions_flaky.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.actions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            queued: self.actions_queued.load(Ordering::Relaxed),
            executed: self.actions_executed.load(Ordering::Relaxed),
            cached: self.actions_cached.load(Ordering::Relaxed),
            served: self.actions_served.load(Ordering::Relaxed),
            flaky: self.actions_flaky.load(Ordering::Relaxed),
            failed: self.actions_failed.load(Ordering::Relaxed),
        }
    }
}
