//! Pacing between steps.
//!
//! A `pause_after` step is followed by a delay long enough for second-granular
//! freshness arithmetic to observe time passing. The delay goes through a
//! [`Pacer`] so tests can substitute a virtual clock.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default pacing interval.
pub const DEFAULT_PAUSE: Duration = Duration::from_secs(3);

/// Source of inter-step delays.
pub trait Pacer: Send + Sync {
    /// Wait for at least `interval`.
    fn pause(&self, interval: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Sleeps on the tokio clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealTimePacer;

impl Pacer for RealTimePacer {
    fn pause(&self, interval: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(interval))
    }
}

/// Returns immediately. For harness self-checks where no cache keeps time.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPause;

impl Pacer for NoPause {
    fn pause(&self, _interval: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(std::future::ready(()))
    }
}
