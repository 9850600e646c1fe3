//! Outcome classification and per-step checks.
//!
//! Everything here is a pure function of one observed exchange: what the
//! client got back, and what the origin saw during the same request.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::Method;
use serde::{Deserialize, Serialize};

use crate::freshening::{predicted_value, MergedSource};
use crate::headers::{find_header, has_header, header_matches, resolve_value};
use crate::origin::{ConditionalKind, ServedExchange};
use crate::schema::ExpectedHeader;
use crate::templates::{ExpectationField, Step};

/// How the cache handled one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Served from the cache; the origin was not contacted.
    Cached,
    /// Forwarded unconditionally.
    NotCached,
    /// Conditional on `Last-Modified`, origin answered in full.
    LmValidate,
    /// Conditional on `ETag`, origin answered in full.
    EtagValidate,
    /// Conditional on `Last-Modified`, origin answered `304`.
    LmValidated,
    /// Conditional on `ETag`, origin answered `304`.
    EtagValidated,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::NotCached => "not_cached",
            Self::LmValidate => "lm_validate",
            Self::EtagValidate => "etag_validate",
            Self::LmValidated => "lm_validated",
            Self::EtagValidated => "etag_validated",
        }
    }

    /// The client response should carry the stored representation.
    pub fn reuses_stored(&self) -> bool {
        matches!(self, Self::Cached | Self::LmValidated | Self::EtagValidated)
    }

    pub fn is_validated(&self) -> bool {
        matches!(self, Self::LmValidated | Self::EtagValidated)
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything observed for one request.
#[derive(Debug, Clone)]
pub struct ObservedExchange {
    pub status: u16,
    pub response_headers: Vec<(String, String)>,
    pub body: Bytes,
    pub request_method: Method,
    /// The origin's record of this request, if the cache forwarded it.
    pub origin: Option<ServedExchange>,
    /// The last full origin response before this request.
    pub stored: Option<ServedExchange>,
    pub elapsed: Duration,
}

impl ObservedExchange {
    pub fn origin_hit(&self) -> bool {
        self.origin.is_some()
    }

    pub fn sent_conditional(&self) -> bool {
        self.conditional_kind().is_some()
    }

    pub fn conditional_kind(&self) -> Option<ConditionalKind> {
        self.origin.as_ref().and_then(|o| o.conditional)
    }
}

/// Classify an exchange into exactly one outcome.
pub fn classify(exchange: &ObservedExchange) -> CacheOutcome {
    let Some(origin) = &exchange.origin else {
        return CacheOutcome::Cached;
    };
    // A conditional only counts when it carries the validator the origin
    // last served; anything else is an unconditional fetch in disguise.
    let conditional = origin.conditional.filter(|_| origin.validator_matched);
    match (conditional, origin.status == 304) {
        (Some(ConditionalKind::IfModifiedSince), true) => CacheOutcome::LmValidated,
        (Some(ConditionalKind::IfNoneMatch), true) => CacheOutcome::EtagValidated,
        (Some(ConditionalKind::IfModifiedSince), false) => CacheOutcome::LmValidate,
        (Some(ConditionalKind::IfNoneMatch), false) => CacheOutcome::EtagValidate,
        (None, _) => CacheOutcome::NotCached,
    }
}

/// One failed expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFailure {
    pub field: ExpectationField,
    pub message: String,
}

impl CheckFailure {
    fn new(field: ExpectationField, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Run every check a step declares. An empty result means the step passed.
pub fn evaluate(step: &Step, anchor: DateTime<Utc>, exchange: &ObservedExchange) -> Vec<CheckFailure> {
    let expected = &step.expected;
    let observed = classify(exchange);
    let mut failures = Vec::new();

    if let Some(want) = expected.outcome {
        if want != observed {
            failures.push(CheckFailure::new(
                ExpectationField::ExpectedType,
                format!("expected {}, observed {}", want, observed),
            ));
        }
    }

    if expected.check_body && expected.response_text.is_none() && observed.reuses_stored() {
        if let Some(failure) = check_stored_body(exchange) {
            failures.push(failure);
        }
    }

    if let Some(status) = expected.status {
        if status != exchange.status {
            failures.push(CheckFailure::new(
                ExpectationField::ExpectedStatus,
                format!("expected status {}, got {}", status, exchange.status),
            ));
        }
    }

    match &expected.response_text {
        Some(None) if !exchange.body.is_empty() => failures.push(CheckFailure::new(
            ExpectationField::ExpectedResponseText,
            format!("expected an empty body, got {} bytes", exchange.body.len()),
        )),
        Some(Some(text)) if exchange.body.as_ref() != text.as_bytes() => failures.push(CheckFailure::new(
            ExpectationField::ExpectedResponseText,
            format!("expected body {:?}, got {:?}", text, String::from_utf8_lossy(&exchange.body)),
        )),
        _ => {}
    }

    for want in &expected.response_headers {
        if let Some(message) = check_response_header(want, anchor, exchange, observed) {
            failures.push(CheckFailure::new(ExpectationField::ExpectedResponseHeaders, message));
        }
    }

    for name in &expected.response_headers_missing {
        if has_header(&exchange.response_headers, name) {
            failures.push(CheckFailure::new(
                ExpectationField::ExpectedResponseHeadersMissing,
                format!("{} should be absent, got {:?}", name, find_header(&exchange.response_headers, name).unwrap_or("")),
            ));
        }
    }

    if !expected.request_headers.is_empty() {
        match &exchange.origin {
            None => failures.push(CheckFailure::new(
                ExpectationField::ExpectedRequestHeaders,
                "origin was not contacted",
            )),
            Some(origin) => {
                for field in &expected.request_headers {
                    let value = resolve_value(field.name(), field.value(), anchor);
                    if !header_matches(&origin.request_headers, field.name(), &value) {
                        failures.push(CheckFailure::new(
                            ExpectationField::ExpectedRequestHeaders,
                            format!(
                                "origin expected {}: {}, got {:?}",
                                field.name(),
                                value,
                                find_header(&origin.request_headers, field.name())
                            ),
                        ));
                    }
                }
            }
        }
    }

    if let Some(method) = &expected.method {
        match &exchange.origin {
            None => failures.push(CheckFailure::new(ExpectationField::ExpectedMethod, "origin was not contacted")),
            Some(origin) if !origin.method.eq_ignore_ascii_case(method.as_str()) => {
                failures.push(CheckFailure::new(
                    ExpectationField::ExpectedMethod,
                    format!("origin expected method {}, got {}", method, origin.method),
                ))
            }
            Some(_) => {}
        }
    }

    failures
}

/// A reused response must carry the stored body. `304` answers to a
/// client's own conditional and `HEAD` carry none.
fn check_stored_body(exchange: &ObservedExchange) -> Option<CheckFailure> {
    if exchange.status == 304 || exchange.request_method == Method::HEAD {
        return None;
    }
    let stored = exchange.stored.as_ref()?;
    if exchange.body == stored.body {
        return None;
    }
    Some(CheckFailure::new(
        ExpectationField::ExpectedResponseText,
        format!(
            "reused response body {:?} differs from stored {:?}",
            String::from_utf8_lossy(&exchange.body),
            String::from_utf8_lossy(&stored.body)
        ),
    ))
}

fn check_response_header(
    want: &ExpectedHeader,
    anchor: DateTime<Utc>,
    exchange: &ObservedExchange,
    observed: CacheOutcome,
) -> Option<String> {
    let headers = &exchange.response_headers;
    let mut message = match want {
        ExpectedHeader::Present(name) if has_header(headers, name) => return None,
        ExpectedHeader::Present(name) => format!("{} should be present", name),
        ExpectedHeader::Equals(field) => {
            let value = resolve_value(field.name(), field.value(), anchor);
            if header_matches(headers, field.name(), &value) {
                return None;
            }
            format!(
                "expected {}: {}, got {:?}",
                field.name(),
                value,
                find_header(headers, field.name())
            )
        }
    };

    if observed.is_validated() {
        if let (Some(stored), Some(origin)) = (&exchange.stored, &exchange.origin) {
            message.push_str(&freshening_diagnostic(want.name(), headers, &stored.headers, &origin.headers));
        }
    }
    Some(message)
}

fn freshening_diagnostic(
    name: &str,
    returned: &[(String, String)],
    stored: &[(String, String)],
    not_modified: &[(String, String)],
) -> String {
    let got = find_header(returned, name);
    let stale = find_header(stored, name);
    let mut note = match predicted_value(stored, not_modified, name) {
        MergedSource::Updated(v) => format!("; freshening predicts {:?} from the 304", v),
        MergedSource::Stored(v) => format!("; freshening predicts stored {:?}", v),
        MergedSource::Absent => "; freshening predicts no value".to_string(),
    };
    if got.is_some() && got == stale && find_header(not_modified, name) != stale {
        note.push_str("; cache returned the stale stored value");
    }
    note
}
