//! # cache-tests
//!
//! Conformance harness for HTTP caches.
//!
//! Declarative JSON suites describe request sequences and the cache behavior
//! each step should exhibit. The harness serves each test from its own origin
//! endpoint, sends the requests through the cache under test, classifies every
//! exchange (`cached`, `not_cached`, `*_validate`, `*_validated`) from what the
//! origin saw, and aggregates verdicts into a report.

pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
pub mod freshening;
pub mod harness;
pub mod headers;
pub mod origin;
pub mod pacing;
pub mod report;
pub mod response;
pub mod runner;
pub mod scheduler;
pub mod schema;
pub mod templates;
pub mod timeouts;

// Transport layer
pub mod transport;

// Re-exports
pub use classify::{classify, CacheOutcome, ObservedExchange};
pub use config::{CacheTarget, HarnessConfig, RunMode, SetupTestsPolicy};
pub use error::{Error, Result};
pub use harness::Harness;
pub use pacing::{NoPause, Pacer, RealTimePacer};
pub use report::{RunReport, Summary, Verdict, VerdictStatus};
pub use schema::{load_suites, TestKind, TestSuite};
pub use timeouts::Timeouts;
