use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cache_tests::Pacer;

/// Whole-second virtual clock shared by a pacer and a reference cache.
#[derive(Clone, Debug, Default)]
pub struct VirtualClock {
    secs: Arc<AtomicI64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> i64 {
        self.secs.load(Ordering::SeqCst)
    }

    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }
}

/// Pacer that advances the virtual clock instead of sleeping, and remembers
/// every interval it was asked for.
pub struct ClockPacer {
    clock: VirtualClock,
    pauses: Mutex<Vec<Duration>>,
}

impl ClockPacer {
    pub fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            pauses: Mutex::new(Vec::new()),
        }
    }

    #[allow(dead_code)]
    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().unwrap().clone()
    }
}

impl Pacer for ClockPacer {
    fn pause(&self, interval: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.pauses.lock().unwrap().push(interval);
        self.clock.advance(interval);
        Box::pin(std::future::ready(()))
    }
}
