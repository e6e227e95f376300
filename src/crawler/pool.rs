//! Fixed pool of launched browser instances
//!
//! The pool is an arena of N slots guarded by a semaphore with N permits. A
//! permit is only ever held together with a slot, so the number of idle slots
//! always equals the number of available permits. Checking out yields a
//! `BrowserLease`; dropping the lease puts the slot back before its permit is
//! released.

use crate::browser::{Browser, BrowserError, BrowserLauncher, InstanceConfig};
use crate::config::BrowserConfig;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Errors raised by the pool
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to launch browser pool: {0}")]
    Launch(#[from] BrowserError),

    #[error("Browser pool needs at least one instance")]
    Empty,

    #[error("Browser pool is closed")]
    Closed,

    #[error("Waiting for a browser was cancelled")]
    Cancelled,

    #[error("No browser became available within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct Slot {
    id: usize,
    browser: Arc<dyn Browser>,
}

struct PoolInner {
    idle: Mutex<Vec<Slot>>,
    available: Arc<Semaphore>,
    size: usize,
    closed: AtomicBool,
    grace: Duration,
    acquire_timeout: Option<Duration>,
}

impl PoolInner {
    /// Returns a slot to the idle list, or closes it if the pool is shutting down
    fn give_back(&self, slot: Slot) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.closed.load(Ordering::Acquire) {
            idle.push(slot);
            return;
        }
        drop(idle);

        tracing::debug!("Closing browser instance {} returned after shutdown", slot.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_slot(slot));
            }
            Err(_) => {
                tracing::warn!(
                    "No runtime to close browser instance {}; it is dropped unclosed",
                    slot.id
                );
            }
        }
    }
}

async fn close_slot(slot: Slot) {
    if let Err(e) = slot.browser.close().await {
        tracing::warn!("Failed to close browser instance {}: {}", slot.id, e);
    }
}

/// A fixed set of browser instances shared by the scheduler's workers
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    /// Launches and connects one browser per slot
    ///
    /// Instance `i` gets its own state directory `{user-data-dir}/instance_{i}`
    /// and remote debugging port `base + i`. If any instance fails, every
    /// instance launched so far is closed and the error is returned.
    ///
    /// # Arguments
    ///
    /// * `launcher` - Backend that starts and connects instances
    /// * `config` - Pool size, state directory root and launch options
    ///
    /// # Returns
    ///
    /// * `Ok(BrowserPool)` - All instances are up
    /// * `Err(PoolError)` - At least one instance failed to start
    pub async fn launch(
        launcher: &dyn BrowserLauncher,
        config: &BrowserConfig,
    ) -> Result<Self, PoolError> {
        if config.pool_size == 0 {
            return Err(PoolError::Empty);
        }

        let root = Path::new(&config.user_data_dir);
        let mut browsers: Vec<Box<dyn Browser>> = Vec::with_capacity(config.pool_size);

        for id in 0..config.pool_size {
            match launch_instance(launcher, config, root, id).await {
                Ok(browser) => {
                    tracing::debug!("Browser instance {} is ready", id);
                    browsers.push(browser);
                }
                Err(e) => {
                    tracing::error!("Failed to launch browser instance {}: {}", id, e);
                    for (launched, browser) in browsers.into_iter().enumerate() {
                        close_slot(Slot {
                            id: launched,
                            browser: Arc::from(browser),
                        })
                        .await;
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!("Launched {} browser instances", config.pool_size);
        Self::from_browsers(browsers, config.shutdown_grace(), config.acquire_timeout())
    }

    /// Builds a pool around already connected browsers
    pub fn from_browsers(
        browsers: Vec<Box<dyn Browser>>,
        grace: Duration,
        acquire_timeout: Option<Duration>,
    ) -> Result<Self, PoolError> {
        if browsers.is_empty() {
            return Err(PoolError::Empty);
        }

        let size = browsers.len();
        let idle = browsers
            .into_iter()
            .enumerate()
            .map(|(id, browser)| Slot {
                id,
                browser: Arc::from(browser),
            })
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                available: Arc::new(Semaphore::new(size)),
                size,
                closed: AtomicBool::new(false),
                grace,
                acquire_timeout,
            }),
        })
    }

    /// Number of instances in the pool
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of instances currently idle
    pub fn available(&self) -> usize {
        self.inner.available.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Checks out an idle instance, waiting until one is free
    ///
    /// The wait ends early when `cancel` fires, when the pool is closed, or
    /// when the configured acquire timeout elapses.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<BrowserLease, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let wait = self.inner.available.clone().acquire_owned();
        let acquired = match self.inner.acquire_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                result = tokio::time::timeout(limit, wait) => {
                    result.map_err(|_| PoolError::Timeout(limit))?
                }
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                result = wait => result,
            },
        };
        let permit = acquired.map_err(|_| PoolError::Closed)?;

        let slot = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(PoolError::Closed)?;

        tracing::trace!("Checked out browser instance {}", slot.id);
        Ok(BrowserLease {
            slot,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Returns a lease to the pool
    ///
    /// Equivalent to dropping it.
    pub fn release(&self, lease: BrowserLease) {
        tracing::trace!("Returning browser instance {}", lease.instance_id());
        drop(lease);
    }

    /// Shuts every instance down
    ///
    /// Waits the grace period first so in-flight jobs can publish their last
    /// events. Idle instances are closed here; leased ones are closed when
    /// their lease comes back. Calling this again is a no-op.
    pub async fn close_all(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Browser pool already closed");
            return;
        }

        tracing::info!(
            "Closing browser pool ({} of {} instances idle)",
            self.available(),
            self.size()
        );
        tokio::time::sleep(self.inner.grace).await;
        self.inner.available.close();

        let idle: Vec<Slot> = std::mem::take(
            &mut *self
                .inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for slot in idle {
            close_slot(slot).await;
        }

        tracing::info!("Browser pool closed");
    }
}

async fn launch_instance(
    launcher: &dyn BrowserLauncher,
    config: &BrowserConfig,
    root: &Path,
    id: usize,
) -> Result<Box<dyn Browser>, PoolError> {
    let user_data_dir = root.join(format!("instance_{}", id));
    tokio::fs::create_dir_all(&user_data_dir).await?;

    let port_offset = u16::try_from(id).map_err(|_| BrowserError::Launch {
        instance: id,
        message: "instance number exceeds the port range".to_string(),
    })?;

    let instance = InstanceConfig {
        id,
        user_data_dir,
        headless: config.headless,
        user_agent: config.user_agent.clone(),
        remote_debugging_port: config.remote_debugging_port.saturating_add(port_offset),
    };

    let handle = launcher.launch(&instance).await?;
    let browser = launcher.connect(&handle).await?;
    Ok(browser)
}

/// Exclusive use of one pooled browser
///
/// The instance goes back to the pool when the lease is dropped, on every
/// path including errors and cancellation.
pub struct BrowserLease {
    slot: Slot,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl BrowserLease {
    /// Slot number of the leased instance
    pub fn instance_id(&self) -> usize {
        self.slot.id
    }
}

impl Deref for BrowserLease {
    type Target = dyn Browser;

    fn deref(&self) -> &Self::Target {
        self.slot.browser.as_ref()
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        // Fields drop after this body, so the slot is idle before the permit frees
        self.pool.give_back(self.slot.clone());
    }
}
