//! Header merging on `304 Not Modified` (RFC 9111 Section 4.3.4).
//!
//! The harness never stores anything itself. This is the model the
//! classifier holds a cache's client-visible response against after a
//! completed revalidation.

use crate::headers::{find_header, find_headers};

/// Connection-scoped fields that a `304` never carries into the stored
/// response.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Framing of the stored body; kept from the stored response, never taken
/// from a `304`.
const FRAMING: &[&str] = &["content-length"];

/// Names listed in a `Connection` header are hop-by-hop for that message.
fn connection_tokens(headers: &[(String, String)]) -> Vec<String> {
    find_headers(headers, "connection")
        .iter()
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn is_hop_by_hop(name: &str, extra: &[String]) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        || extra.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Apply the freshening rule.
///
/// - every field of the `304` replaces all stored fields of the same name
/// - hop-by-hop fields are dropped from both sides; stored `Content-Length`
///   survives, a `304`'s does not
/// - validators follow from the first rule
///
/// Replaced fields move to the end in the `304`'s order, so applying the
/// same `304` again yields the same list.
pub fn freshen(stored: &[(String, String)], not_modified: &[(String, String)]) -> Vec<(String, String)> {
    let stored_conn = connection_tokens(stored);
    let update_conn = connection_tokens(not_modified);

    let updates: Vec<&(String, String)> = not_modified
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name, &update_conn))
        .filter(|(name, _)| !FRAMING.iter().any(|f| name.eq_ignore_ascii_case(f)))
        .collect();

    let mut merged: Vec<(String, String)> = stored
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name, &stored_conn))
        .filter(|(name, _)| !updates.iter().any(|(u, _)| u.eq_ignore_ascii_case(name)))
        .cloned()
        .collect();
    merged.extend(updates.into_iter().cloned());
    merged
}

/// Where the value a client should see for a header comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergedSource {
    /// The `304` carried the header; its value wins.
    Updated(String),
    /// Only the stored response carried it.
    Stored(String),
    /// Neither did.
    Absent,
}

/// Predict the post-freshening value of one header.
pub fn predicted_value(
    stored: &[(String, String)],
    not_modified: &[(String, String)],
    name: &str,
) -> MergedSource {
    let merged = freshen(stored, not_modified);
    match find_header(&merged, name) {
        None => MergedSource::Absent,
        Some(value) => {
            let from_update = find_headers(not_modified, name).contains(&value);
            if from_update {
                MergedSource::Updated(value.to_string())
            } else {
                MergedSource::Stored(value.to_string())
            }
        }
    }
}
