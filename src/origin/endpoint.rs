//! Per-test endpoint state: the armed response plan, the validators last
//! served, and the log of every request that reached the origin.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::headers::{find_header, http_date, parse_http_date, with_default};

/// Which validator a conditional request carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalKind {
    /// `If-None-Match` (entity-tag validation).
    IfNoneMatch,
    /// `If-Modified-Since` (last-modified validation).
    IfModifiedSince,
}

/// What the origin sends for the currently armed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePlan {
    pub step: usize,
    pub status: u16,
    /// Materialized headers in declared order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Reply `304` to a conditional whose validator matches.
    pub answer_conditionals: bool,
}

/// One request the origin received and what it answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedExchange {
    /// Step armed when the request arrived.
    pub step: usize,
    pub method: String,
    pub request_headers: Vec<(String, String)>,
    pub conditional: Option<ConditionalKind>,
    pub validator_matched: bool,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ServedExchange {
    /// A response the cache may have stored as a whole representation.
    pub fn is_full(&self) -> bool {
        self.status != 304
    }
}

/// State of one test's endpoint.
#[derive(Debug, Default)]
pub struct EndpointState {
    plan: Option<ResponsePlan>,
    last_etag: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    log: Vec<ServedExchange>,
}

impl EndpointState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the plan used for the next requests.
    pub fn arm(&mut self, plan: ResponsePlan) {
        self.plan = Some(plan);
    }

    pub fn log(&self) -> &[ServedExchange] {
        &self.log
    }

    /// Answer one request and record it.
    ///
    /// `Date` is added when the plan declares none. Full responses are framed
    /// with `Content-Length`; any declared framing is replaced.
    pub fn serve(&mut self, method: &str, request_headers: Vec<(String, String)>, now: DateTime<Utc>) -> ServedExchange {
        let plan = self.plan.clone().unwrap_or_else(|| ResponsePlan {
            step: 0,
            status: 200,
            headers: Vec::new(),
            body: Bytes::new(),
            answer_conditionals: false,
        });

        let (conditional, validator_matched) = self.evaluate_conditional(&request_headers);

        let headers: Vec<(String, String)> = plan
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("content-length") && !name.eq_ignore_ascii_case("transfer-encoding")
            })
            .cloned()
            .collect();
        let mut headers = with_default(headers, "Date", http_date(now, 0));

        let not_modified = plan.answer_conditionals && validator_matched;
        let (status, body) = if not_modified {
            (304, Bytes::new())
        } else {
            let body = if method.eq_ignore_ascii_case("HEAD") { Bytes::new() } else { plan.body.clone() };
            headers.push(("Content-Length".to_string(), plan.body.len().to_string()));
            (plan.status, body)
        };

        if not_modified {
            // A 304 replaces only the validators it carries.
            if let Some(etag) = find_header(&headers, "etag") {
                self.last_etag = Some(etag.to_string());
            }
            if let Some(modified) = find_header(&headers, "last-modified").and_then(parse_http_date) {
                self.last_modified = Some(modified);
            }
        } else {
            self.last_etag = find_header(&headers, "etag").map(str::to_string);
            self.last_modified = find_header(&headers, "last-modified").and_then(parse_http_date);
        }

        let served = ServedExchange {
            step: plan.step,
            method: method.to_string(),
            request_headers,
            conditional,
            validator_matched,
            status,
            headers,
            body,
        };
        self.log.push(served.clone());
        served
    }

    /// `If-None-Match` takes precedence over `If-Modified-Since`
    /// (RFC 9110 Section 13.2.2).
    fn evaluate_conditional(&self, request_headers: &[(String, String)]) -> (Option<ConditionalKind>, bool) {
        if let Some(inm) = find_header(request_headers, "if-none-match") {
            let matched = self
                .last_etag
                .as_deref()
                .map(|etag| etag_list_matches(inm, etag))
                .unwrap_or(false);
            return (Some(ConditionalKind::IfNoneMatch), matched);
        }
        if let Some(ims) = find_header(request_headers, "if-modified-since") {
            let matched = match (parse_http_date(ims), self.last_modified) {
                (Some(since), Some(modified)) => since >= modified,
                _ => false,
            };
            return (Some(ConditionalKind::IfModifiedSince), matched);
        }
        (None, false)
    }
}

/// Weak comparison of an `If-None-Match` list against the current entity-tag.
pub fn etag_list_matches(list: &str, current: &str) -> bool {
    let current = strip_weak(current.trim());
    list.split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || strip_weak(candidate) == current)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}
