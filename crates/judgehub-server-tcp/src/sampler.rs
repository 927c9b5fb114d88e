//! Periodic sampling of gauge metrics
//!
//! The core keeps no counters of its own; event counters live next to the
//! listeners, and the inventory gauges (worker count, running, queued,
//! groups in progress) are sampled here.

use std::sync::Arc;
use std::time::Duration;

use judgehub_server::{TaskManager, WorkerManager};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

pub fn spawn(wm: Arc<WorkerManager>, tm: Arc<TaskManager>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            metrics::gauge!("judgehub_live_workers").set(wm.worker_count() as f64);
            metrics::gauge!("judgehub_running_jobs").set(wm.total_running() as f64);
            metrics::gauge!("judgehub_queued_jobs").set(tm.total_queued() as f64);
            metrics::gauge!("judgehub_groups_in_progress").set(tm.group_count() as f64);
        }
    });
}
