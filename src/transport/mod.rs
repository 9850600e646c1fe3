//! HTTP transport.
//!
//! - HTTP/1.1 over plain TCP via httparse + tokio

pub mod h1;
