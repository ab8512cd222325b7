use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::PoolConfig;

/// How many health-check results are kept per instance for trend inspection.
pub const HEALTH_HISTORY_LEN: usize = 10;

/// Rolling per-instance metrics used for health decisions.
#[derive(Debug, Clone)]
pub struct HandleMetrics {
    pub memory_mb: f64,
    pub open_page_count: usize,
    pub last_used_at: Instant,
    pub error_count: u32,
    pub started_at: Instant,
    history: VecDeque<bool>,
}

impl HandleMetrics {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            memory_mb: 0.0,
            open_page_count: 0,
            last_used_at: now,
            error_count: 0,
            started_at: now,
            history: VecDeque::with_capacity(HEALTH_HISTORY_LEN),
        }
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Fraction of the most recent health checks that passed.
    ///
    /// Returns 1.0 for an instance that has never been checked.
    pub fn healthy_fraction(&self) -> f64 {
        if self.history.is_empty() {
            return 1.0;
        }
        let healthy = self.history.iter().filter(|h| **h).count();
        healthy as f64 / self.history.len() as f64
    }

    /// A passing check also clears accumulated errors, so the error
    /// criterion stays "recent" instead of lifetime-cumulative.
    pub(crate) fn record_check(&mut self, healthy: bool) {
        if self.history.len() == HEALTH_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(healthy);
        if healthy {
            self.error_count = 0;
        }
    }

    /// Check every health criterion against the configured thresholds.
    ///
    /// The lifetime bound retires even instances that never fail a direct
    /// check, so slow resource creep is bounded by rotation.
    pub(crate) fn evaluate(&self, config: &PoolConfig) -> Result<(), &'static str> {
        if self.memory_mb >= config.max_memory_mb {
            return Err("memory above ceiling");
        }
        if self.open_page_count > config.max_open_pages {
            return Err("too many open pages");
        }
        if self.error_count >= config.max_error_count {
            return Err("too many recent errors");
        }
        if self.age() >= config.max_lifetime {
            return Err("past maximum lifetime");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded_to_last_ten() {
        let mut metrics = HandleMetrics::new();
        for _ in 0..7 {
            metrics.record_check(false);
        }
        for _ in 0..8 {
            metrics.record_check(true);
        }
        // 15 checks recorded, only the last 10 kept: 2 false, 8 true
        assert!((metrics.healthy_fraction() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn unchecked_instance_counts_as_healthy() {
        let metrics = HandleMetrics::new();
        assert_eq!(metrics.healthy_fraction(), 1.0);
    }

    #[test]
    fn passing_check_clears_accumulated_errors() {
        let config = PoolConfig::default();
        let mut metrics = HandleMetrics::new();

        // an old burst just under the threshold
        metrics.error_count = config.max_error_count - 1;
        assert!(metrics.evaluate(&config).is_ok());

        metrics.record_check(true);
        assert_eq!(metrics.error_count, 0);

        // one new error after a clean check is no longer condemning
        metrics.error_count += 1;
        assert!(metrics.evaluate(&config).is_ok());
    }

    #[test]
    fn evaluate_flags_each_threshold() {
        let config = PoolConfig::default();
        let mut metrics = HandleMetrics::new();
        assert!(metrics.evaluate(&config).is_ok());

        metrics.memory_mb = config.max_memory_mb;
        assert_eq!(metrics.evaluate(&config), Err("memory above ceiling"));
        metrics.memory_mb = 0.0;

        metrics.open_page_count = config.max_open_pages + 1;
        assert_eq!(metrics.evaluate(&config), Err("too many open pages"));
        metrics.open_page_count = 0;

        metrics.error_count = config.max_error_count;
        assert_eq!(metrics.evaluate(&config), Err("too many recent errors"));
    }
}
