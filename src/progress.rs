// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::statistics::Statistics;

/// First report after this long.
const START_DELAY: Duration = Duration::from_millis(3000);
/// Delay scaling per report: 6/5, up to a soft cap.
const DELAY_SCALING_NUMERATOR: u32 = 6;
const DELAY_SCALING_DENOMINATOR: u32 = 5;
const MAX_DELAY: Duration = Duration::from_secs(60);

/// How many active target names one report line samples.
const SAMPLE_SIZE: usize = 3;

///
/// The set of currently running actions, sampled by the progress reporter.
///
#[derive(Default)]
pub struct ActiveTargets {
    targets: Mutex<BTreeSet<String>>,
}

impl ActiveTargets {
    pub fn new() -> ActiveTargets {
        ActiveTargets::default()
    }

    pub fn insert(&self, target: &str) {
        self.targets.lock().insert(target.to_string());
    }

    pub fn remove(&self, target: &str) {
        self.targets.lock().remove(target);
    }

    pub fn sample(&self, count: usize) -> (usize, Vec<String>) {
        let targets = self.targets.lock();
        (targets.len(), targets.iter().take(count).cloned().collect())
    }
}

///
/// A cooperatively scheduled progress reporter: a task that wakes on a growing interval,
/// snapshots the statistics, and emits one human-readable line. The interval starts small
/// and stretches, so short builds stay quiet and long builds do not spam. Errors inside the
/// report itself are logged and do not stop the loop.
///
pub struct ProgressReporter {
    statistics: Arc<Statistics>,
    active_targets: Arc<ActiveTargets>,
    shutdown: Arc<Notify>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn start(
        statistics: Arc<Statistics>,
        active_targets: Arc<ActiveTargets>,
    ) -> ProgressReporter {
        let shutdown = Arc::new(Notify::new());
        let handle = {
            let statistics = statistics.clone();
            let active_targets = active_targets.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut delay = START_DELAY;
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = tokio::time::sleep(delay) => {
                            let report = std::panic::AssertUnwindSafe(async {
                                Self::report(&statistics, &active_targets);
                            });
                            if report.catch_unwind().await.is_err() {
                                warn!("calling progress report function failed; continuing");
                            }
                        }
                    }
                    delay = (delay * DELAY_SCALING_NUMERATOR / DELAY_SCALING_DENOMINATOR)
                        .min(MAX_DELAY);
                }
            })
        };
        ProgressReporter {
            statistics,
            active_targets,
            shutdown,
            handle: Some(handle),
        }
    }

    fn report(statistics: &Statistics, active_targets: &ActiveTargets) {
        let snapshot = statistics.snapshot();
        let (active, sample) = active_targets.sample(SAMPLE_SIZE);
        let mut line = format!(
            "{} cached, {} run, {} processing",
            snapshot.cached, snapshot.executed, active
        );
        if snapshot.served > 0 {
            line.push_str(&format!(", {} served", snapshot.served));
        }
        if snapshot.flaky > 0 {
            line.push_str(&format!(", {} flaky", snapshot.flaky));
        }
        if !sample.is_empty() {
            let mut names = sample.join(", ");
            if active > sample.len() {
                names.push_str(", ...");
            }
            line.push_str(&format!(" ({names})"));
        }
        info!("{line}");
    }

    /// Emit one final report and stop the reporter task.
    pub async fn finish(mut self) {
        Self::report(&self.statistics, &self.active_targets);
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::statistics::Statistics;

    use super::{ActiveTargets, ProgressReporter};

    #[test]
    fn sample_is_bounded_and_sorted() {
        let targets = ActiveTargets::new();
        targets.insert("charlie");
        targets.insert("alpha");
        targets.insert("bravo");
        targets.insert("delta");

        let (active, sample) = targets.sample(3);
        assert_eq!(active, 4);
        assert_eq!(sample, vec!["alpha", "bravo", "charlie"]);

        targets.remove("alpha");
        let (active, sample) = targets.sample(3);
        assert_eq!(active, 3);
        assert_eq!(sample, vec!["bravo", "charlie", "delta"]);
    }

    #[tokio::test]
    async fn reporter_starts_and_stops() {
        let statistics = Arc::new(Statistics::new());
        let active_targets = Arc::new(ActiveTargets::new());
        statistics.increment_cached();
        active_targets.insert("some action");

        let reporter = ProgressReporter::start(statistics, active_targets);
        reporter.finish().await;
    }
}
