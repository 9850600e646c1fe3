//! Header value materialization and header-list helpers.
//!
//! Test definitions carry symbolic header values: offsets in seconds for
//! date-valued headers and seeds for content-derived tokens. Everything here
//! is pure; the anchor timestamp is always passed in.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine as _};
use chrono::{DateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};

use crate::schema::{HeaderField, HeaderValue};

/// IMF-fixdate, the preferred HTTP date format (RFC 9110 Section 5.6.7).
const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Obsolete formats a recipient must still accept.
const OBSOLETE_DATE_FORMATS: &[&str] = &[
    "%A, %d-%b-%y %H:%M:%S GMT", // RFC 850
    "%a %b %e %H:%M:%S %Y",      // ANSI C asctime()
];

/// Headers whose numeric values are offsets from the anchor.
const DATE_HEADERS: &[&str] = &[
    "date",
    "expires",
    "last-modified",
    "if-modified-since",
    "if-unmodified-since",
];

/// Headers whose content-derived values are entity-tags and get quoted.
const ETAG_HEADERS: &[&str] = &["etag", "if-none-match", "if-match"];

/// Length of a content-derived token in characters.
const TOKEN_LEN: usize = 22;

/// Whether numeric values of this header are date offsets.
pub fn is_date_header(name: &str) -> bool {
    DATE_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Format `anchor + offset_secs` as an IMF-fixdate.
///
/// Offsets that fall outside chrono's representable range collapse to the
/// anchor itself.
pub fn http_date(anchor: DateTime<Utc>, offset_secs: i64) -> String {
    let when = TimeDelta::try_seconds(offset_secs)
        .and_then(|delta| anchor.checked_add_signed(delta))
        .unwrap_or_else(|| {
            tracing::warn!("date offset {} out of range, using anchor", offset_secs);
            anchor
        });
    when.format(IMF_FIXDATE).to_string()
}

/// Parse any of the three HTTP date formats.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, IMF_FIXDATE) {
        return Some(naive.and_utc());
    }
    OBSOLETE_DATE_FORMATS.iter().find_map(|fmt| {
        chrono::NaiveDateTime::parse_from_str(value, fmt)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

/// Deterministic short token derived from a seed.
///
/// SHA-256 of the seed, base64url without padding, truncated. The same seed
/// always yields the same token, so repeated steps can present an identical
/// validator without any shared state.
pub fn content_token(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut token = BASE64URL.encode(digest);
    token.truncate(TOKEN_LEN);
    token
}

/// Materialize one symbolic value for the header `name`.
pub fn resolve_value(name: &str, value: &HeaderValue, anchor: DateTime<Utc>) -> String {
    match value {
        HeaderValue::Literal(text) => text.clone(),
        HeaderValue::Offset(secs) if is_date_header(name) => http_date(anchor, *secs),
        HeaderValue::Offset(number) => number.to_string(),
        HeaderValue::Content { content } => {
            let token = content_token(content);
            if ETAG_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                format!("\"{}\"", token)
            } else {
                token
            }
        }
    }
}

/// Materialize a header list, preserving order and repeated names.
pub fn resolve_headers(fields: &[HeaderField], anchor: DateTime<Utc>) -> Vec<(String, String)> {
    fields
        .iter()
        .map(|field| (field.name().to_string(), resolve_value(field.name(), field.value(), anchor)))
        .collect()
}

/// First value of a header (case-insensitive).
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// All values of a header in wire order.
pub fn find_headers<'a>(headers: &'a [(String, String)], name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
        .collect()
}

/// Whether a header is present at all.
pub fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(key, _)| key.eq_ignore_ascii_case(name))
}

/// Whether the header carries `expected`, either on one field line or as the
/// comma-joined combination of all its lines.
pub fn header_matches(headers: &[(String, String)], name: &str, expected: &str) -> bool {
    let values = find_headers(headers, name);
    if values.iter().any(|v| v.trim() == expected.trim()) {
        return true;
    }
    !values.is_empty() && values.join(", ") == expected.trim()
}

/// Add a header unless one with the same name is already present.
pub fn with_default(mut headers: Vec<(String, String)>, name: &str, value: impl Into<String>) -> Vec<(String, String)> {
    if !has_header(&headers, name) {
        headers.push((name.to_string(), value.into()));
    }
    headers
}
