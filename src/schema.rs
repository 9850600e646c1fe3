//! Declarative test definitions.
//!
//! Suites are JSON documents. A suite holds test cases; a test case holds
//! an ordered list of request steps. Steps are raw here: every field is
//! optional so that templates can fill the gaps. [`crate::templates`] turns
//! them into fully specified [`crate::templates::Step`]s.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::classify::CacheOutcome;
use crate::error::{Error, Result};

/// How a failing verdict of a test is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// Failure is a conformance violation.
    #[default]
    Required,
    /// Failure is a missed optimization.
    Optimal,
    /// Informational only.
    Check,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Optimal => "optimal",
            Self::Check => "check",
        }
    }
}

/// Symbolic header value.
///
/// JSON numbers are offsets, `{"content": seed}` objects are
/// content-derived tokens, strings are literals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// Seconds relative to the test's anchor (date headers) or a plain number.
    Offset(i64),
    /// Deterministic token derived from a seed string.
    Content { content: String },
    /// Passed through unchanged.
    Literal(String),
}

/// One `(name, value)` header line, written as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderField(pub String, pub HeaderValue);

impl HeaderField {
    pub fn new(name: impl Into<String>, value: HeaderValue) -> Self {
        Self(name.into(), value)
    }

    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self(name.into(), HeaderValue::Literal(value.into()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn value(&self) -> &HeaderValue {
        &self.1
    }
}

/// Expected client-visible response header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectedHeader {
    /// Header must carry this value.
    Equals(HeaderField),
    /// Header must be present with any value.
    Present(String),
}

impl ExpectedHeader {
    pub fn name(&self) -> &str {
        match self {
            Self::Equals(field) => field.name(),
            Self::Present(name) => name,
        }
    }
}

/// One raw step of a test's exchange sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Vec<HeaderField>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<HeaderField>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_after: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_type: Option<CacheOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
    /// Absent: unchecked. `null`: body must be empty. String: exact body.
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub expected_response_text: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response_headers: Option<Vec<ExpectedHeader>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response_headers_missing: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_request_headers: Option<Vec<HeaderField>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_body: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_tests: Option<Vec<String>>,
}

/// A single test: an ordered exchange sequence plus scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub kind: TestKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub browser_only: bool,
    #[serde(default)]
    pub browser_skip: bool,
    pub requests: Vec<RequestSpec>,
}

/// A named collection of tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub tests: Vec<TestCase>,
    /// Suite-local templates; shadow built-ins of the same name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub templates: BTreeMap<String, RequestSpec>,
}

impl TestSuite {
    /// Load a suite from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let suite: Self = serde_json::from_str(json)?;
        suite.check_shape()?;
        Ok(suite)
    }

    /// Serialize the suite to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a suite from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| match e {
            Error::Json(inner) => Error::schema(format!("{}: {}", path.display(), inner)),
            other => other,
        })
    }

    /// Structural checks serde cannot express.
    fn check_shape(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::schema(format!("suite {:?} has an empty id", self.name)));
        }
        for test in &self.tests {
            if test.id.is_empty() {
                return Err(Error::schema(format!("test {:?} has an empty id", test.name)));
            }
            if test.id.contains(['/', '?', '#', ' ']) {
                return Err(Error::schema(format!(
                    "test id {:?} is not usable as a path segment",
                    test.id
                )));
            }
            if test.requests.is_empty() {
                return Err(Error::schema(format!("test {} has no requests", test.id)));
            }
        }
        Ok(())
    }
}

/// Load every suite file, in the order given.
pub fn load_suites<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<TestSuite>> {
    paths.iter().map(|p| TestSuite::from_file(p.as_ref())).collect()
}

/// Distinguish an explicit `null` from an absent field.
fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}
