//! Timeout configuration for exchanges with the cache under test.
//!
//! # Timeout Types
//!
//! - **connect**: TCP handshake to the cache (or origin in direct mode)
//! - **response**: request sent → complete response received
//!
//! A timeout cancels only the request it guards. The step reports a transport
//! failure and the test becomes inconclusive.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cache_tests::Timeouts;
//! use std::time::Duration;
//!
//! let timeouts = Timeouts::harness_defaults().response(Duration::from_secs(5));
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Timeout configuration for one exchange.
///
/// When a phase is `None`, no timeout is applied for it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for establishing the TCP connection.
    ///
    /// Default: 10s
    pub connect: Option<Duration>,

    /// Deadline from request sent until the full response is read, body
    /// included. Does NOT reset on progress.
    ///
    /// Default: 30s
    pub response: Option<Duration>,
}

impl Timeouts {
    /// Create a new Timeouts with all timeouts set to None.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for a conformance run.
    ///
    /// - connect: 10s
    /// - response: 30s
    pub fn harness_defaults() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            response: Some(Duration::from_secs(30)),
        }
    }

    /// Set connect timeout.
    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    /// Set response timeout.
    pub fn response(mut self, timeout: Duration) -> Self {
        self.response = Some(timeout);
        self
    }

    /// Disable connect timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect = None;
        self
    }

    /// Disable response timeout.
    pub fn no_response_timeout(mut self) -> Self {
        self.response = None;
        self
    }
}

/// Run `fut` under an optional deadline, mapping expiry through `on_expiry`.
pub async fn within<T, F>(limit: Option<Duration>, on_expiry: fn(Duration) -> Error, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| on_expiry(limit))?,
        None => fut.await,
    }
}
