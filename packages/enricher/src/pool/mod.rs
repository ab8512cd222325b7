//! Bounded, self-healing pool of headless browser instances.
//!
//! Browser processes are expensive and stateful, so the pool keeps between
//! `min_instances` and `max_instances` of them alive, health-checks them
//! before every hand-out, resets their session state between callers, and
//! rotates out instances that grow too old, too big, or too flaky. A
//! background maintenance task catches degraded idle instances that are
//! never requested.

mod health;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::PoolConfig;

pub use health::{HandleMetrics, HEALTH_HISTORY_LEN};

/// How often an unhealthy instance may be retired and replaced within a
/// single acquire before the acquire fails outright.
const MAX_REPLACEMENTS: u32 = 3;

/// Launches browser instances. Implemented by the chromiumoxide driver and
/// by mocks in tests.
#[async_trait]
pub trait BrowserDriver: Send + Sync + 'static {
    type Instance: BrowserInstance;

    async fn launch(&self) -> Result<Self::Instance>;
}

/// One live browser process, owned exclusively by the pool.
#[async_trait]
pub trait BrowserInstance: Send + Sync + 'static {
    /// Load `url` and return the rendered document.
    async fn fetch_page(&self, url: &Url, timeout: Duration) -> Result<FetchedPage>;

    /// Clear cookies and permissions, close extra tabs, and park the
    /// remaining tab on a blank page so no state leaks to the next caller.
    async fn reset_session(&self) -> Result<()>;

    /// Probe memory usage and open page count.
    async fn sample(&self) -> Result<InstanceSample>;

    async fn close(self) -> Result<()>;
}

/// A rendered page as returned by a browser instance.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub html: String,
}

/// A point-in-time resource probe of one instance.
#[derive(Debug, Clone, Copy)]
pub struct InstanceSample {
    pub memory_mb: f64,
    pub open_pages: usize,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a browser instance")]
    AcquireTimeout(Duration),
    #[error("gave up after retiring {attempts} unhealthy browser instances")]
    NoHealthyInstance { attempts: u32 },
}

/// An exclusively-held browser instance plus its metrics.
#[derive(Debug)]
pub struct BrowserHandle<I> {
    pub id: Uuid,
    instance: I,
    metrics: HandleMetrics,
}

impl<I: BrowserInstance> BrowserHandle<I> {
    fn new(instance: I) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance,
            metrics: HandleMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &HandleMetrics {
        &self.metrics
    }

    /// Fetch through the held instance, tracking errors against its health.
    pub async fn fetch_page(&mut self, url: &Url, timeout: Duration) -> Result<FetchedPage> {
        self.metrics.last_used_at = tokio::time::Instant::now();
        match self.instance.fetch_page(url, timeout).await {
            Ok(page) => Ok(page),
            Err(err) => {
                self.metrics.error_count += 1;
                Err(err)
            }
        }
    }
}

/// Current pool occupancy. `total - available` instances are checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
}

struct PoolState<I> {
    available: VecDeque<BrowserHandle<I>>,
    total: usize,
}

pub struct BrowserPool<D: BrowserDriver> {
    driver: D,
    config: PoolConfig,
    state: Mutex<PoolState<D::Instance>>,
    available_notify: Notify,
}

enum Action<I> {
    Check(BrowserHandle<I>),
    Create,
    Wait,
}

impl<D: BrowserDriver> BrowserPool<D> {
    pub fn new(driver: D, config: PoolConfig) -> Self {
        Self {
            driver,
            config,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                total: 0,
            }),
            available_notify: Notify::new(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            total: state.total,
            available: state.available.len(),
        }
    }

    /// Acquire an exclusively-owned, healthy, freshly-reset instance.
    ///
    /// Scales up before waiting when the pool is below `max_instances`.
    /// Instances that fail the pre-hand-out health check are retired and
    /// replaced, at most [`MAX_REPLACEMENTS`] times per call.
    pub async fn acquire(&self) -> Result<BrowserHandle<D::Instance>, PoolError> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        let mut replaced = 0u32;

        loop {
            let action = {
                let mut state = self.state.lock().unwrap();
                if let Some(handle) = state.available.pop_front() {
                    Action::Check(handle)
                } else if state.total < self.config.max_instances {
                    state.total += 1;
                    Action::Create
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Check(mut handle) => {
                    if self.check_health(&mut handle).await {
                        match handle.instance.reset_session().await {
                            Ok(()) => return Ok(handle),
                            Err(err) => {
                                warn!(
                                    handle_id = %handle.id,
                                    error = %err,
                                    "session reset failed, retiring instance"
                                );
                                self.retire(handle).await;
                            }
                        }
                    } else {
                        self.retire(handle).await;
                    }
                    replaced += 1;
                    if replaced >= MAX_REPLACEMENTS {
                        return Err(PoolError::NoHealthyInstance { attempts: replaced });
                    }
                    // capacity freed, the next iteration launches a substitute
                }
                Action::Create => match self.launch().await {
                    Ok(handle) => return Ok(handle),
                    Err(err) => {
                        self.state.lock().unwrap().total -= 1;
                        if replaced > 0 {
                            error!(error = %err, "replacement browser launch failed, pool shrinks by one");
                        } else {
                            warn!(error = %err, "browser launch failed, pool does not grow");
                        }
                        if !self.wait_for_release(deadline).await {
                            return Err(PoolError::AcquireTimeout(self.config.acquire_timeout));
                        }
                    }
                },
                Action::Wait => {
                    if !self.wait_for_release(deadline).await {
                        return Err(PoolError::AcquireTimeout(self.config.acquire_timeout));
                    }
                }
            }
        }
    }

    /// Reset and return a handle to the available set.
    ///
    /// If the idle set would exceed `min_instances`, the longest-idle
    /// instance is retired so the pool drains back to its low-water mark.
    pub async fn release(&self, mut handle: BrowserHandle<D::Instance>) {
        handle.metrics.last_used_at = tokio::time::Instant::now();

        if let Err(err) = handle.instance.reset_session().await {
            warn!(
                handle_id = %handle.id,
                error = %err,
                "session reset failed on release, retiring instance"
            );
            self.retire(handle).await;
            return;
        }

        let excess = {
            let mut state = self.state.lock().unwrap();
            state.available.push_back(handle);
            if state.available.len() > self.config.min_instances {
                state.available.pop_front()
            } else {
                None
            }
        };
        if let Some(extra) = excess {
            debug!(handle_id = %extra.id, "scaling down idle browser beyond low-water mark");
            self.retire(extra).await;
        }
        self.available_notify.notify_one();
    }

    /// Launch instances until the pool reaches `min_instances`.
    ///
    /// Launch failures are logged and stop the attempt; the pool simply does
    /// not grow this cycle.
    pub async fn ensure_min(&self) {
        loop {
            let reserved = {
                let mut state = self.state.lock().unwrap();
                if state.total < self.config.min_instances {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };
            if !reserved {
                break;
            }
            match self.launch().await {
                Ok(handle) => {
                    self.state.lock().unwrap().available.push_back(handle);
                    self.available_notify.notify_one();
                }
                Err(err) => {
                    self.state.lock().unwrap().total -= 1;
                    warn!(error = %err, "browser launch failed, pool does not grow this cycle");
                    break;
                }
            }
        }
    }

    /// Health-check every idle instance, replacing unhealthy ones.
    ///
    /// Catches degraded instances that are never requested by a caller.
    pub async fn run_maintenance(&self) {
        let idle: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.available.drain(..).collect()
        };

        let mut healthy = Vec::with_capacity(idle.len());
        for mut handle in idle {
            if self.check_health(&mut handle).await {
                healthy.push(handle);
            } else {
                info!(handle_id = %handle.id, "replacing unhealthy idle browser");
                self.retire(handle).await;
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            for handle in healthy {
                state.available.push_back(handle);
            }
        }
        self.ensure_min().await;
        self.available_notify.notify_waiters();
    }

    /// Run [`run_maintenance`](Self::run_maintenance) on a fixed interval.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                pool.run_maintenance().await;
            }
        })
    }

    /// Close all idle instances. Checked-out handles must be released first.
    pub async fn shutdown(&self) {
        let idle: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.available.drain(..).collect()
        };
        for handle in idle {
            self.retire(handle).await;
        }
    }

    async fn launch(&self) -> Result<BrowserHandle<D::Instance>> {
        let instance = self.driver.launch().await?;
        let handle = BrowserHandle::new(instance);
        debug!(handle_id = %handle.id, "launched browser instance");
        Ok(handle)
    }

    async fn check_health(&self, handle: &mut BrowserHandle<D::Instance>) -> bool {
        let verdict = match handle.instance.sample().await {
            Ok(sample) => {
                handle.metrics.memory_mb = sample.memory_mb;
                handle.metrics.open_page_count = sample.open_pages;
                handle.metrics.evaluate(&self.config)
            }
            Err(err) => {
                debug!(handle_id = %handle.id, error = %err, "metrics probe failed");
                handle.metrics.error_count += 1;
                Err("instance did not answer metrics probe")
            }
        };

        match verdict {
            Ok(()) => {
                handle.metrics.record_check(true);
                true
            }
            Err(reason) => {
                warn!(
                    handle_id = %handle.id,
                    reason,
                    memory_mb = handle.metrics.memory_mb,
                    open_pages = handle.metrics.open_page_count,
                    error_count = handle.metrics.error_count,
                    "browser instance failed health check"
                );
                handle.metrics.record_check(false);
                false
            }
        }
    }

    async fn retire(&self, handle: BrowserHandle<D::Instance>) {
        {
            self.state.lock().unwrap().total -= 1;
        }
        let BrowserHandle { id, instance, .. } = handle;
        if let Err(err) = instance.close().await {
            warn!(handle_id = %id, error = %err, "error closing retired browser");
        }
        // capacity was freed, a waiter may now scale up
        self.available_notify.notify_one();
    }

    async fn wait_for_release(&self, deadline: tokio::time::Instant) -> bool {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::timeout_at(deadline, self.available_notify.notified())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct MockState {
        memory_mb: Mutex<f64>,
        open_pages: Mutex<usize>,
        closed: AtomicBool,
        resets: Mutex<usize>,
    }

    impl MockState {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                memory_mb: Mutex::new(100.0),
                open_pages: Mutex::new(1),
                closed: AtomicBool::new(false),
                resets: Mutex::new(0),
            })
        }

        fn set_memory(&self, mb: f64) {
            *self.memory_mb.lock().unwrap() = mb;
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    struct MockInstance {
        state: Arc<MockState>,
    }

    #[async_trait]
    impl BrowserInstance for MockInstance {
        async fn fetch_page(&self, url: &Url, _timeout: Duration) -> Result<FetchedPage> {
            Ok(FetchedPage {
                final_url: url.to_string(),
                html: "<html></html>".to_string(),
            })
        }

        async fn reset_session(&self) -> Result<()> {
            *self.state.resets.lock().unwrap() += 1;
            Ok(())
        }

        async fn sample(&self) -> Result<InstanceSample> {
            Ok(InstanceSample {
                memory_mb: *self.state.memory_mb.lock().unwrap(),
                open_pages: *self.state.open_pages.lock().unwrap(),
            })
        }

        async fn close(self) -> Result<()> {
            self.state.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockDriver {
        launched: Mutex<Vec<Arc<MockState>>>,
        fail_launch: AtomicBool,
    }

    #[async_trait]
    impl BrowserDriver for Arc<MockDriver> {
        type Instance = MockInstance;

        async fn launch(&self) -> Result<MockInstance> {
            if self.fail_launch.load(Ordering::SeqCst) {
                anyhow::bail!("browser failed to start");
            }
            let state = MockState::new();
            self.launched.lock().unwrap().push(Arc::clone(&state));
            Ok(MockInstance { state })
        }
    }

    fn test_config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_instances: min,
            max_instances: max,
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        }
    }

    fn new_pool(min: usize, max: usize) -> (Arc<MockDriver>, BrowserPool<Arc<MockDriver>>) {
        let driver = Arc::new(MockDriver::default());
        let pool = BrowserPool::new(Arc::clone(&driver), test_config(min, max));
        (driver, pool)
    }

    #[tokio::test(start_paused = true)]
    async fn scales_up_to_max_then_times_out() {
        let (_driver, pool) = new_pool(1, 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { total: 2, available: 0 });

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout(_)));
        assert_eq!(pool.stats().total, 2);

        pool.release(a).await;
        pool.release(b).await;
    }

    #[tokio::test(start_paused = true)]
    async fn release_scales_down_to_min() {
        let (driver, pool) = new_pool(1, 3);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.stats(), PoolStats { total: 3, available: 0 });

        pool.release(a).await;
        pool.release(b).await;
        pool.release(c).await;

        // drained back to the low-water mark
        assert_eq!(pool.stats(), PoolStats { total: 1, available: 1 });
        let closed = driver
            .launched
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_closed())
            .count();
        assert_eq!(closed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_size_stays_within_bounds() {
        let (_driver, pool) = new_pool(1, 2);
        pool.ensure_min().await;

        for _ in 0..4 {
            let a = pool.acquire().await.unwrap();
            let stats = pool.stats();
            assert!(stats.total <= 2);
            let b = pool.acquire().await.unwrap();
            let stats = pool.stats();
            assert!(stats.total >= 1 && stats.total <= 2);
            pool.release(a).await;
            pool.release(b).await;
            let stats = pool.stats();
            assert!(stats.total >= 1 && stats.total <= 2);
            assert_eq!(stats.available, stats.total);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_instance_is_retired_not_handed_out() {
        let (driver, pool) = new_pool(1, 2);

        let a = pool.acquire().await.unwrap();
        let first_id = a.id;
        pool.release(a).await;

        // degrade the idle instance past the memory ceiling
        driver.launched.lock().unwrap()[0].set_memory(50_000.0);

        let b = pool.acquire().await.unwrap();
        assert_ne!(b.id, first_id);
        assert!(driver.launched.lock().unwrap()[0].is_closed());
        assert_eq!(pool.stats().total, 1);
        pool.release(b).await;
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_attempts_are_bounded() {
        let (driver, pool) = new_pool(3, 3);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;
        pool.release(c).await;

        for state in driver.launched.lock().unwrap().iter() {
            state.set_memory(50_000.0);
        }
        driver.fail_launch.store(true, Ordering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::NoHealthyInstance { attempts: 3 }));
        assert!(driver
            .launched
            .lock()
            .unwrap()
            .iter()
            .all(|s| s.is_closed()));
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_replaces_unhealthy_idle_instances() {
        let (driver, pool) = new_pool(1, 2);
        pool.ensure_min().await;
        assert_eq!(pool.stats(), PoolStats { total: 1, available: 1 });

        driver.launched.lock().unwrap()[0].set_memory(50_000.0);
        pool.run_maintenance().await;

        assert_eq!(pool.stats(), PoolStats { total: 1, available: 1 });
        let launched = driver.launched.lock().unwrap();
        assert_eq!(launched.len(), 2);
        assert!(launched[0].is_closed());
        assert!(!launched[1].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn handles_are_reset_before_reuse() {
        let (driver, pool) = new_pool(1, 1);

        let a = pool.acquire().await.unwrap();
        pool.release(a).await;
        let b = pool.acquire().await.unwrap();

        // one reset on release, one before the second hand-out
        assert_eq!(*driver.launched.lock().unwrap()[0].resets.lock().unwrap(), 2);
        pool.release(b).await;
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_wakes_on_release() {
        let (_driver, pool) = new_pool(1, 1);
        let pool = Arc::new(pool);

        let a = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let handle = pool.acquire().await.unwrap();
                pool.release(handle).await;
            })
        };

        tokio::task::yield_now().await;
        pool.release(a).await;
        waiter.await.unwrap();
    }
}
