//! Bounded pool of reusable scraping-engine instances.
//!
//! Capacity is enforced by a semaphore: a caller holds one permit for the
//! lifetime of its [`ScraperLease`], so the number of handles in use can
//! never exceed `max_size`. The lease returns its handle on drop, which
//! covers success, error and cancellation alike.

pub mod engine;

pub use engine::{
    BrowserlessLauncher, EngineConfig, EngineLauncher, FetchedPage, ScrapeEngine, Viewport,
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::errors::{EngineError, PoolError};

/// Pool sizing and recycling policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    /// Idle handles unused for this long are destroyed by the reaper.
    pub idle_timeout: Duration,
    /// Consecutive failures after which a handle is destroyed on release.
    pub max_failures: u32,
    pub launch_attempts: u32,
    /// Base delay between launch attempts, multiplied by the attempt number.
    pub launch_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_failures: 3,
            launch_attempts: 2,
            launch_backoff: Duration::from_millis(250),
        }
    }
}

/// One engine instance owned by the pool.
pub struct PooledBrowser {
    pub id: u64,
    pub config: EngineConfig,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Instant,
    pub failure_count: u32,
    pub in_use: bool,
    engine: Arc<dyn ScrapeEngine>,
}

/// How a lease ended, as reported to [`ScraperLease::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub launched_total: u64,
    pub destroyed_total: u64,
    pub closed: bool,
}

struct PoolState {
    idle: VecDeque<PooledBrowser>,
    /// Idle plus leased plus launching.
    live: usize,
    next_id: u64,
    launched_total: u64,
    destroyed_total: u64,
    closed: bool,
}

struct Shared {
    config: PoolConfig,
    launcher: Arc<dyn EngineLauncher>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, mut handle: PooledBrowser) {
        let mut st = self.lock();
        if st.closed || handle.failure_count >= self.config.max_failures {
            st.live -= 1;
            st.destroyed_total += 1;
            drop(st);
            tracing::info!(
                handle = handle.id,
                failures = handle.failure_count,
                "destroying scraper handle"
            );
            dispose(handle.engine);
            return;
        }
        handle.in_use = false;
        handle.last_used_at = Instant::now();
        st.idle.push_back(handle);
    }
}

/// Shut an engine down in the background.
fn dispose(engine: Arc<dyn ScrapeEngine>) {
    if let Ok(rt) = tokio::runtime::Handle::try_current() {
        rt.spawn(async move { engine.shutdown().await });
    }
}

/// Holds one unit of `live` capacity while a handle is launched.
struct Reservation<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().live -= 1;
        }
    }
}

/// Shared handle to the scraper pool. Cheap to clone.
#[derive(Clone)]
pub struct ScraperPool {
    shared: Arc<Shared>,
}

impl ScraperPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn EngineLauncher>) -> Result<Self, PoolError> {
        if config.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1".into()));
        }
        if config.launch_attempts == 0 {
            return Err(PoolError::InvalidConfig(
                "launch_attempts must be at least 1".into(),
            ));
        }
        let permits = Arc::new(Semaphore::new(config.max_size));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                launcher,
                permits,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                    next_id: 1,
                    launched_total: 0,
                    destroyed_total: 0,
                    closed: false,
                }),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Lease a handle configured exactly as `config`.
    ///
    /// Waits up to `acquire_timeout` for capacity. Reuses a compatible idle
    /// handle when one exists; otherwise launches a new engine, evicting an
    /// incompatible idle handle first if the pool is full.
    pub async fn acquire(&self, config: &EngineConfig) -> Result<ScraperLease, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        if self.shared.lock().closed {
            return Err(PoolError::PoolExhausted);
        }

        let waited = self.shared.config.acquire_timeout;
        let permit = match tokio::time::timeout(
            waited,
            Arc::clone(&self.shared.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::PoolExhausted),
            Err(_) => {
                tracing::warn!(?waited, "timed out waiting for a scraper");
                return Err(PoolError::AcquireTimeout { waited });
            }
        };

        let evicted = {
            let mut st = self.shared.lock();
            if st.closed {
                return Err(PoolError::PoolExhausted);
            }
            if let Some(pos) = st.idle.iter().position(|h| &h.config == config)
                && let Some(mut handle) = st.idle.remove(pos)
            {
                handle.in_use = true;
                tracing::debug!(handle = handle.id, "reusing idle scraper");
                return Ok(ScraperLease::new(Arc::clone(&self.shared), handle, permit));
            }
            let evicted = if st.live >= self.shared.config.max_size {
                let victim = st.idle.pop_front();
                if victim.is_some() {
                    st.live -= 1;
                    st.destroyed_total += 1;
                }
                victim
            } else {
                None
            };
            st.live += 1;
            evicted
        };
        let mut reservation = Reservation {
            shared: &self.shared,
            armed: true,
        };
        if let Some(old) = evicted {
            tracing::debug!(handle = old.id, "evicting scraper with incompatible config");
            dispose(old.engine);
        }

        let engine = self.launch(config).await?;

        let handle = {
            let mut st = self.shared.lock();
            let id = st.next_id;
            st.next_id += 1;
            st.launched_total += 1;
            PooledBrowser {
                id,
                config: config.clone(),
                created_at: Utc::now(),
                last_used_at: Instant::now(),
                failure_count: 0,
                in_use: true,
                engine: Arc::from(engine),
            }
        };
        reservation.armed = false;
        tracing::info!(handle = handle.id, stealth = config.stealth, "launched scraper");
        Ok(ScraperLease::new(Arc::clone(&self.shared), handle, permit))
    }

    async fn launch(&self, config: &EngineConfig) -> Result<Box<dyn ScrapeEngine>, PoolError> {
        let attempts = self.shared.config.launch_attempts;
        let mut last_err = EngineError::Launch("no launch attempted".into());
        for attempt in 1..=attempts {
            match self.shared.launcher.launch(config).await {
                Ok(engine) => return Ok(engine),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "engine launch failed");
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.shared.config.launch_backoff * attempt).await;
                    }
                }
            }
        }
        Err(PoolError::EngineLaunch {
            attempts,
            source: last_err,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock();
        PoolStats {
            max_size: self.shared.config.max_size,
            idle: st.idle.len(),
            in_use: st.live - st.idle.len(),
            launched_total: st.launched_total,
            destroyed_total: st.destroyed_total,
            closed: st.closed,
        }
    }

    /// Destroy idle handles unused for longer than `idle_timeout`.
    pub fn reap_idle(&self) -> usize {
        self.reap_idle_at(Instant::now())
    }

    fn reap_idle_at(&self, now: Instant) -> usize {
        let expired: Vec<PooledBrowser> = {
            let mut st = self.shared.lock();
            let timeout = self.shared.config.idle_timeout;
            let (expired, keep): (VecDeque<_>, VecDeque<_>) = st
                .idle
                .drain(..)
                .partition(|h| now.saturating_duration_since(h.last_used_at) >= timeout);
            st.idle = keep;
            st.live -= expired.len();
            st.destroyed_total += expired.len() as u64;
            expired.into_iter().collect()
        };
        let count = expired.len();
        for handle in expired {
            dispose(handle.engine);
        }
        if count > 0 {
            tracing::debug!(count, "reaped idle scrapers");
        }
        count
    }

    /// Periodically reap idle handles until the pool shuts down.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let tick = (pool.shared.config.idle_timeout / 2).max(Duration::from_secs(1));
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if pool.shared.lock().closed {
                    break;
                }
                pool.reap_idle();
            }
        })
    }

    /// Stop handing out leases and destroy idle handles. Outstanding leases
    /// are destroyed when they come back.
    pub async fn shutdown(&self) {
        let idle: Vec<PooledBrowser> = {
            let mut st = self.shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            let idle: Vec<_> = st.idle.drain(..).collect();
            st.live -= idle.len();
            st.destroyed_total += idle.len() as u64;
            idle
        };
        self.shared.permits.close();
        tracing::info!(destroyed = idle.len(), "scraper pool shut down");
        for handle in idle {
            handle.engine.shutdown().await;
        }
    }
}

/// Scoped loan of one pooled handle. Returned to the pool on drop.
pub struct ScraperLease {
    shared: Arc<Shared>,
    handle: Option<PooledBrowser>,
    _permit: OwnedSemaphorePermit,
}

impl ScraperLease {
    fn new(shared: Arc<Shared>, handle: PooledBrowser, permit: OwnedSemaphorePermit) -> Self {
        Self {
            shared,
            handle: Some(handle),
            _permit: permit,
        }
    }

    fn handle(&self) -> &PooledBrowser {
        self.handle
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease handle taken before drop"))
    }

    fn handle_mut(&mut self) -> &mut PooledBrowser {
        self.handle
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease handle taken before drop"))
    }

    pub fn id(&self) -> u64 {
        self.handle().id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.handle().config
    }

    pub fn failure_count(&self) -> u32 {
        self.handle().failure_count
    }

    pub fn engine(&self) -> &dyn ScrapeEngine {
        self.handle().engine.as_ref()
    }

    /// Fetch through the leased engine, recording the outcome on the handle.
    pub async fn fetch(&mut self, url: &str) -> Result<FetchedPage, EngineError> {
        let engine = Arc::clone(&self.handle().engine);
        let result = engine.fetch(url).await;
        match &result {
            Ok(_) => self.mark_ok(),
            Err(_) => self.mark_failed(),
        }
        result
    }

    pub fn mark_failed(&mut self) {
        self.handle_mut().failure_count += 1;
    }

    pub fn mark_ok(&mut self) {
        self.handle_mut().failure_count = 0;
    }

    /// Return the handle with an explicit outcome.
    pub fn release(mut self, outcome: ReleaseOutcome) {
        match outcome {
            ReleaseOutcome::Success => self.mark_ok(),
            ReleaseOutcome::Failure => self.mark_failed(),
        }
    }
}

impl Drop for ScraperLease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.give_back(handle);
        }
    }
}
