//! Exponentially smoothed rate estimators and the per-(worker, treelet)
//! demand tracker.

use crate::rays::{TreeletId, WorkerId};
use crate::worker::WorkerStats;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default smoothing time constant.
const DEFAULT_TAU: Duration = Duration::from_secs(5);

/// Tracks the rate of change of a counter sampled at wall-clock times,
/// exponentially weighted with time constant τ.
#[derive(Clone, Debug)]
pub struct RateEstimator {
    rate: f64,
    tau: f64,
    last_update: Option<Instant>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_TAU)
    }
}

impl RateEstimator {
    /// Create an estimator with the given time constant.
    ///
    /// * `tau` - The smoothing time constant.
    pub fn new(tau: Duration) -> Self {
        Self {
            rate: 0.0,
            tau: tau.as_secs_f64(),
            last_update: None,
        }
    }

    /// Feed the counter's delta since the previous update.
    ///
    /// * `count` - Counter increments since the last update.
    pub fn update(&mut self, count: f64) {
        self.update_at(Instant::now(), count);
    }

    /// Feed a delta observed at an explicit time. Exposed so tests can
    /// drive the clock.
    ///
    /// * `now`   - Observation time.
    /// * `count` - Counter increments since the last update.
    pub fn update_at(&mut self, now: Instant, count: f64) {
        match self.last_update {
            None => {
                self.last_update = Some(now);
            }
            Some(prev) => {
                let dt = now.saturating_duration_since(prev).as_secs_f64();
                if dt <= 0.0 {
                    return;
                }
                let instantaneous = count / dt;
                let alpha = 1.0 - (-dt / self.tau).exp();
                self.rate += alpha * (instantaneous - self.rate);
                self.last_update = Some(now);
            }
        }
    }

    /// The smoothed per-second rate.
    pub fn get_rate(&self) -> f64 {
        self.rate
    }
}

/// Demand per (worker, treelet), with by-worker, by-treelet, and total
/// sums kept incrementally in sync with the underlying estimators.
#[derive(Default)]
pub struct DemandTracker {
    estimators: HashMap<(WorkerId, TreeletId), RateEstimator>,
    by_worker: HashMap<WorkerId, f64>,
    by_treelet: HashMap<TreeletId, f64>,
    total: f64,
}

impl DemandTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one worker's interval stats into the demand estimates.
    ///
    /// * `worker_id` - The reporting worker.
    /// * `stats`     - The interval stats.
    pub fn submit(&mut self, worker_id: WorkerId, stats: &WorkerStats) {
        self.submit_at(Instant::now(), worker_id, stats);
    }

    /// `submit` with an explicit observation time, for tests.
    pub fn submit_at(&mut self, now: Instant, worker_id: WorkerId, stats: &WorkerStats) {
        for (treelet_id, ray_stats) in &stats.object_stats {
            let old_rate = self.worker_treelet_demand(worker_id, *treelet_id);
            let estimator = self
                .estimators
                .entry((worker_id, *treelet_id))
                .or_default();
            estimator.update_at(now, ray_stats.demanded_rays as f64);

            let change = estimator.get_rate() - old_rate;
            self.total += change;
            *self.by_worker.entry(worker_id).or_default() += change;
            *self.by_treelet.entry(*treelet_id).or_default() += change;
        }
    }

    /// Demand generated by one worker, over all treelets.
    pub fn worker_demand(&self, worker_id: WorkerId) -> f64 {
        self.by_worker.get(&worker_id).copied().unwrap_or(0.0)
    }

    /// Demand for one treelet, over all workers.
    pub fn treelet_demand(&self, treelet_id: TreeletId) -> f64 {
        self.by_treelet.get(&treelet_id).copied().unwrap_or(0.0)
    }

    /// Demand for one treelet from one worker.
    pub fn worker_treelet_demand(&self, worker_id: WorkerId, treelet_id: TreeletId) -> f64 {
        self.estimators
            .get(&(worker_id, treelet_id))
            .map(|e| e.get_rate())
            .unwrap_or(0.0)
    }

    /// Total demand across the system.
    pub fn net_demand(&self) -> f64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::RayStats;

    #[test]
    fn steady_input_converges_to_the_true_rate() {
        let mut estimator = RateEstimator::new(Duration::from_secs(5));
        let start = Instant::now();
        // 100 demanded rays every second for a minute.
        for i in 0..60 {
            estimator.update_at(start + Duration::from_secs(i), 100.0);
        }
        let rate = estimator.get_rate();
        assert!((rate - 100.0).abs() < 1.0, "rate was {rate}");
    }

    #[test]
    fn first_sample_only_arms_the_clock() {
        let mut estimator = RateEstimator::default();
        estimator.update_at(Instant::now(), 1_000.0);
        assert_eq!(estimator.get_rate(), 0.0);
    }

    #[test]
    fn axis_sums_stay_in_sync_with_the_estimators() {
        let mut tracker = DemandTracker::new();
        let start = Instant::now();

        let mut stats = WorkerStats::default();
        stats.object_stats.insert(
            1,
            RayStats {
                demanded_rays: 50,
                ..RayStats::default()
            },
        );
        stats.object_stats.insert(
            2,
            RayStats {
                demanded_rays: 10,
                ..RayStats::default()
            },
        );

        for i in 0..20 {
            tracker.submit_at(start + Duration::from_secs(i), 7, &stats);
        }

        let w = tracker.worker_demand(7);
        let t = tracker.treelet_demand(1) + tracker.treelet_demand(2);
        assert!((w - t).abs() < 1e-6);
        assert!((tracker.net_demand() - w).abs() < 1e-6);
        assert!(tracker.treelet_demand(1) > tracker.treelet_demand(2));
    }

    #[test]
    fn unknown_ids_report_zero_demand() {
        let tracker = DemandTracker::new();
        assert_eq!(tracker.worker_demand(1), 0.0);
        assert_eq!(tracker.treelet_demand(9), 0.0);
        assert_eq!(tracker.worker_treelet_demand(1, 9), 0.0);
    }
}
