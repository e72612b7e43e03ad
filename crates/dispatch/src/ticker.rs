//! Periodic engine ticker.
//!
//! Entity-change dispatch only evaluates rules when something changes;
//! `for`-delays and time windows also need a clock. The ticker runs a full
//! engine pass on a fixed interval so due runtimes fire on schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use latch_rules::engine;
use latch_rules::executor::ActionExecutor;
use latch_rules::repository::EngineRepos;

use crate::stats::DispatcherStats;

/// Floor for the tick interval; anything faster just burns the database.
const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Drives [`engine::run_rules`] on an interval until shut down.
pub struct EngineTicker {
    repos: Arc<dyn EngineRepos>,
    executor: Arc<ActionExecutor>,
    stats: Arc<DispatcherStats>,
    interval: Duration,
}

impl EngineTicker {
    pub fn new(
        repos: Arc<dyn EngineRepos>,
        executor: Arc<ActionExecutor>,
        stats: Arc<DispatcherStats>,
        interval: Duration,
    ) -> Self {
        Self {
            repos,
            executor,
            stats,
            interval: interval.max(MIN_TICK_INTERVAL),
        }
    }

    /// Spawn the tick loop; it stops when `shutdown` is notified.
    pub fn start(self, shutdown: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The immediate first tick would race startup; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        match engine::run_rules(Utc::now(), &*self.repos, &self.executor).await {
                            Ok(run) => {
                                self.stats.record_rules_result(
                                    run.evaluated,
                                    run.fired,
                                    run.scheduled,
                                    run.errors,
                                );
                                if run.fired > 0 || run.scheduled > 0 {
                                    debug!(
                                        fired = run.fired,
                                        scheduled = run.scheduled,
                                        "engine tick"
                                    );
                                }
                            }
                            Err(e) => {
                                self.stats.record_rules_result(0, 0, 0, 1);
                                warn!(error = %e, "engine tick failed");
                            }
                        }
                    }
                }
            }
            debug!("engine ticker stopped");
        })
    }
}
