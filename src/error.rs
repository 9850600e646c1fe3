//! Error types for the cache-tests harness.
//!
//! Two families live here. Schema faults abort a run before any request is
//! sent. Transport errors are local to one request and surface as an
//! inconclusive verdict, never as a cache-semantics failure.

use std::io;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading suites or driving exchanges.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed test definition.
    #[error("Schema fault: {0}")]
    Schema(String),

    /// Two tests in the corpus share an id.
    #[error("Duplicate test id: {0}")]
    DuplicateTestId(String),

    /// `depends_on` names a test that does not exist.
    #[error("Test {test} depends on unknown test {dependency}")]
    UnknownDependency { test: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A step references a template that is neither built in nor suite-local.
    #[error("Test {test} references unknown template {template}")]
    UnknownTemplate { test: String, template: String },

    /// `setup_tests` names something that is not an expectation field.
    #[error("Test {test} lists unknown setup_tests field {field}")]
    InvalidSetupTest { test: String, field: String },

    /// HTTP protocol error.
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect timeout (TCP handshake to the cache or origin).
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// No complete response within the response deadline.
    #[error("Response timeout after {0:?} - cache did not answer")]
    ResponseTimeout(Duration),

    /// The origin endpoint for a test was never registered.
    #[error("Unknown origin endpoint: {0}")]
    UnknownEndpoint(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a schema fault.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Create an HTTP protocol error.
    pub fn http_protocol(message: impl Into<String>) -> Self {
        Self::HttpProtocol(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create an IO error with custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(io::Error::other(message.into()))
    }

    /// Schema faults abort the run before any request is sent.
    pub fn is_schema_fault(&self) -> bool {
        matches!(
            self,
            Self::Schema(_)
                | Self::DuplicateTestId(_)
                | Self::UnknownDependency { .. }
                | Self::CyclicDependency { .. }
                | Self::UnknownTemplate { .. }
                | Self::InvalidSetupTest { .. }
                | Self::Json(_)
        )
    }

    /// Transport failures make a step inconclusive rather than failed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::HttpProtocol(_)
                | Self::Connection(_)
                | Self::ConnectTimeout(_)
                | Self::ResponseTimeout(_)
                | Self::Io(_)
        )
    }
}
