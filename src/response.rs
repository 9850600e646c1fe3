//! HTTP response as seen by the harness client.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::headers;

/// Response received from the cache under test.
///
/// Header lines keep wire order and repetition; nothing is combined.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body: Bytes,
    http_version: String,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes, http_version: String) -> Self {
        Self { status, headers, body, http_version }
    }

    pub fn http_version(&self) -> &str { &self.http_version }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn into_body(self) -> Bytes { self.body }
    pub fn is_not_modified(&self) -> bool { self.status == 304 }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        headers::find_header(&self.headers, name)
    }

    pub fn get_headers(&self, name: &str) -> Vec<&str> {
        headers::find_headers(&self.headers, name)
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| Error::http_protocol(format!("UTF-8 decode error: {}", e)))
    }
}
