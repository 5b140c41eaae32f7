//! Concurrency limiter for downloads and mosaic assembly.
//!
//! A single semaphore pool with an in-flight counter. Permits are owned so
//! they can move into spawned tasks, and are released on drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Bounds the number of concurrent operations of one kind.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    permits: usize,
    in_flight: Arc<AtomicUsize>,
    label: String,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with `permits` slots (at least one).
    pub fn new(permits: usize, label: impl Into<String>) -> Self {
        let permits = permits.max(1);
        let label = label.into();
        tracing::debug!(permits, label = %label, "Created concurrency limiter");
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            label,
        }
    }

    /// Creates a limiter sized for CPU-bound work on this machine.
    pub fn for_cpu(label: impl Into<String>) -> Self {
        Self::new(default_cpu_permits(), label)
    }

    /// Waits for a permit.
    ///
    /// # Returns
    ///
    /// `None` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<LimiterPermit> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok()?,
        };
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(LimiterPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Number of permits for CPU-bound work: the available parallelism.
pub fn default_cpu_permits() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// A held limiter slot.
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
