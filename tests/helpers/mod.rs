#![allow(dead_code)]

pub mod clock;
pub mod reference_cache;

use std::sync::Arc;

use cache_tests::origin::OriginServer;
use cache_tests::{CacheTarget, Harness, HarnessConfig, RunReport, TestSuite};
use tokio::sync::watch;

use clock::{ClockPacer, VirtualClock};
use reference_cache::ReferenceCache;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn suite(json: &str) -> TestSuite {
    TestSuite::from_json(json).expect("suite should parse")
}

/// A harness wired to a fresh reference cache in front of a fresh origin.
pub struct Bench {
    pub clock: VirtualClock,
    pub pacer: Arc<ClockPacer>,
    pub cache: ReferenceCache,
    origin: OriginServer,
}

impl Bench {
    pub async fn new() -> Self {
        Self::with_cache(|cache| cache).await
    }

    pub async fn with_cache(configure: impl FnOnce(ReferenceCache) -> ReferenceCache) -> Self {
        init_tracing();
        let origin = OriginServer::bind("127.0.0.1:0", None).await.unwrap();
        let clock = VirtualClock::new();
        let cache = configure(
            ReferenceCache::new(origin.local_addr().unwrap(), clock.clone())
                .await
                .unwrap(),
        );
        Self {
            pacer: Arc::new(ClockPacer::new(clock.clone())),
            clock,
            cache,
            origin,
        }
    }

    /// Run suites through the cache, one test at a time so that tests do not
    /// move the shared virtual clock under each other.
    pub async fn run(self, config: HarnessConfig, suites: &[TestSuite]) -> (RunReport, Arc<ClockPacer>, ReferenceCache) {
        let Bench { pacer, mut cache, origin, .. } = self;
        let config = config
            .target(CacheTarget::ReverseProxy { cache: cache.addr() })
            .concurrency(1);
        let harness = Harness::new(config, suites).unwrap();
        cache.start();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let report = harness.run_on(origin, pacer.clone(), cancel_rx).await.unwrap();
        (report, pacer, cache)
    }
}
