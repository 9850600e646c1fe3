//! Harness configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::pacing::DEFAULT_PAUSE;
use crate::timeouts::Timeouts;

/// Which class of cache is under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Private cache: `browser_skip` tests are dropped.
    Browser,
    /// Shared cache: `browser_only` tests are dropped.
    #[default]
    Shared,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Shared => "shared",
        }
    }
}

/// How failures of fields listed in a step's `setup_tests` are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SetupTestsPolicy {
    /// Failure of the test's own kind.
    #[default]
    Enforce,
    /// Always a required failure, whatever the test's kind.
    Required,
    /// A setup failure; the test yields no pass/fail.
    Precondition,
}

/// Where requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheTarget {
    /// Absolute-form requests to a forward proxy at `proxy` (`host:port`).
    ForwardProxy { proxy: String },
    /// Origin-form requests to a cache at `cache` that fronts the origin.
    ReverseProxy { cache: String },
    /// Straight to the origin, no cache. Every request is a miss.
    Direct,
}

impl fmt::Display for CacheTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForwardProxy { proxy } => write!(f, "forward-proxy {}", proxy),
            Self::ReverseProxy { cache } => write!(f, "reverse-proxy {}", cache),
            Self::Direct => f.write_str("direct"),
        }
    }
}

/// Configuration for one run.
///
/// # Defaults
///
/// - target: direct
/// - origin bind: `127.0.0.1:0`
/// - mode: shared
/// - pause: 3s
/// - timeouts: connect 10s, response 30s
/// - concurrency: 8
/// - setup_tests policy: enforce
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub target: CacheTarget,
    pub origin_bind: String,
    /// How the cache reaches the origin; derived from the bound address
    /// when unset.
    pub origin_public: Option<Url>,
    pub mode: RunMode,
    pub pause: Duration,
    pub timeouts: Timeouts,
    /// Maximum number of tests in flight.
    pub concurrency: usize,
    pub setup_tests_policy: SetupTestsPolicy,
    /// When non-empty, run only these tests and their dependencies.
    pub only: Vec<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            target: CacheTarget::Direct,
            origin_bind: "127.0.0.1:0".to_string(),
            origin_public: None,
            mode: RunMode::default(),
            pause: DEFAULT_PAUSE,
            timeouts: Timeouts::harness_defaults(),
            concurrency: 8,
            setup_tests_policy: SetupTestsPolicy::default(),
            only: Vec::new(),
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: CacheTarget) -> Self {
        self.target = target;
        self
    }

    pub fn origin_bind(mut self, addr: impl Into<String>) -> Self {
        self.origin_bind = addr.into();
        self
    }

    pub fn origin_public(mut self, url: Url) -> Self {
        self.origin_public = Some(url);
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the in-flight limit; zero is treated as one.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    pub fn setup_tests_policy(mut self, policy: SetupTestsPolicy) -> Self {
        self.setup_tests_policy = policy;
        self
    }

    pub fn only<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = ids.into_iter().map(Into::into).collect();
        self
    }
}
