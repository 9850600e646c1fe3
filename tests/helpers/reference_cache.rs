//! A small shared HTTP cache in reverse-proxy position, used as the system
//! under test. Time comes from a [`VirtualClock`], so pauses cost nothing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cache_tests::freshening::freshen;
use cache_tests::headers::{find_header, find_headers, parse_http_date};
use cache_tests::transport::h1::{read_request, H1Connection, RequestHead, RequestTarget};
use http::Method;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use super::clock::VirtualClock;

const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "content-length", "host"];

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Virtual time the response was received.
    pub stored_at: i64,
}

#[derive(Debug)]
pub enum CacheStatus {
    /// Usable without contacting the origin; carries the current age.
    Fresh(CacheEntry, i64),
    /// Present but not usable as is; revalidate when it has validators.
    Revalidate(CacheEntry),
    Miss,
}

/// Parsed `Cache-Control` directives across every field line.
struct Directives(Vec<(String, Option<String>)>);

impl Directives {
    fn parse(headers: &[(String, String)]) -> Self {
        let list = find_headers(headers, "cache-control")
            .iter()
            .flat_map(|line| line.split(','))
            .filter_map(|item| {
                let item = item.trim();
                if item.is_empty() {
                    return None;
                }
                Some(match item.split_once('=') {
                    Some((name, value)) => (name.trim().to_ascii_lowercase(), Some(value.trim().trim_matches('"').to_string())),
                    None => (item.to_ascii_lowercase(), None),
                })
            })
            .collect();
        Self(list)
    }

    fn has(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    /// Delta-seconds value; invalid or negative values count as zero.
    fn seconds(&self, name: &str) -> Option<i64> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref().and_then(|v| v.parse::<i64>().ok()).unwrap_or(0).max(0))
    }
}

impl CacheEntry {
    fn age_header(&self) -> i64 {
        find_header(&self.headers, "age")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0)
            .max(0)
    }

    pub fn current_age(&self, now: i64) -> i64 {
        self.age_header() + (now - self.stored_at).max(0)
    }

    /// Shared-cache freshness lifetime; no heuristics.
    pub fn freshness_lifetime(&self) -> i64 {
        let cc = Directives::parse(&self.headers);
        if let Some(s) = cc.seconds("s-maxage") {
            return s;
        }
        if let Some(m) = cc.seconds("max-age") {
            return m;
        }
        let expires = find_header(&self.headers, "expires").map(parse_http_date);
        let date = find_header(&self.headers, "date").and_then(parse_http_date);
        match (expires, date) {
            (Some(Some(expires)), Some(date)) => (expires - date).num_seconds().max(0),
            // Invalid Expires means already expired.
            _ => 0,
        }
    }

    fn etag(&self) -> Option<&str> {
        find_header(&self.headers, "etag")
    }

    fn last_modified(&self) -> Option<&str> {
        find_header(&self.headers, "last-modified")
    }
}

pub fn etag_of(entry: &CacheEntry) -> Option<&str> {
    entry.etag()
}

/// Storage keyed by request target.
#[derive(Default)]
pub struct HttpCache {
    entries: HashMap<String, CacheEntry>,
}

impl HttpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, method: &str, key: &str, request: &[(String, String)], now: i64) -> CacheStatus {
        if method != "GET" {
            return CacheStatus::Miss;
        }
        let Some(entry) = self.entries.get(key) else {
            return CacheStatus::Miss;
        };

        let req = Directives::parse(request);
        let stored = Directives::parse(&entry.headers);
        let age = entry.current_age(now);
        let lifetime = entry.freshness_lifetime();

        let mut usable = age < lifetime;
        if let Some(max_stale) = req.0.iter().find(|(n, _)| n == "max-stale") {
            let allowance = max_stale.1.as_deref().and_then(|v| v.parse::<i64>().ok()).unwrap_or(i64::MAX);
            usable |= age - lifetime <= allowance;
        }
        if req.has("no-cache") || stored.has("no-cache") {
            usable = false;
        }
        if let Some(max_age) = req.seconds("max-age") {
            usable &= age <= max_age;
        }
        if let Some(min_fresh) = req.seconds("min-fresh") {
            usable &= lifetime - age >= min_fresh;
        }

        if usable {
            CacheStatus::Fresh(entry.clone(), age)
        } else {
            CacheStatus::Revalidate(entry.clone())
        }
    }

    pub fn store(&mut self, key: &str, entry: CacheEntry) {
        let cc = Directives::parse(&entry.headers);
        if entry.status != 200 || cc.has("no-store") || cc.has("private") {
            return;
        }
        self.entries.insert(key.to_string(), entry);
    }
}

struct Shared {
    origin: SocketAddr,
    clock: VirtualClock,
    cache: Mutex<HttpCache>,
    requests: Mutex<Vec<(i64, String)>>,
    keep_stale_headers_on_304: AtomicBool,
}

/// Reverse-proxy cache in front of one origin.
pub struct ReferenceCache {
    listener: Option<TcpListener>,
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl ReferenceCache {
    pub async fn new(origin: SocketAddr, clock: VirtualClock) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener: Some(listener),
            addr,
            shared: Arc::new(Shared {
                origin,
                clock,
                cache: Mutex::new(HttpCache::new()),
                requests: Mutex::new(Vec::new()),
                keep_stale_headers_on_304: AtomicBool::new(false),
            }),
        })
    }

    /// Misbehave: serve the stored headers unchanged after a `304`.
    pub fn keep_stale_headers_on_304(self) -> Self {
        self.shared.keep_stale_headers_on_304.store(true, Ordering::SeqCst);
        self
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// `(virtual time, target)` of every client request, in arrival order.
    pub fn client_requests(&self) -> Vec<(i64, String)> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else { return };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream, Arc::clone(&shared)));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        break;
                    }
                }
            }
        });
    }
}

/// One request per connection; every reply closes.
async fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buffer = Vec::new();
    if let Ok(Some(request)) = read_request(&mut stream, &mut buffer).await {
        let (status, headers, body) = serve(&shared, &request).await;
        let _ = write_response(&mut stream, status, &headers, &body).await;
    }
}

async fn serve(shared: &Shared, request: &RequestHead) -> (u16, Vec<(String, String)>, Bytes) {
    let now = shared.clock.now();
    shared.requests.lock().unwrap().push((now, request.target.clone()));

    let req_cc = Directives::parse(&request.headers);
    let key = request.target.clone();
    let status = if req_cc.has("no-store") {
        CacheStatus::Miss
    } else {
        shared.cache.lock().unwrap().get(&request.method, &key, &request.headers, now)
    };

    let stale = match status {
        CacheStatus::Fresh(entry, age) => return reply_from(&entry, age),
        CacheStatus::Revalidate(entry) => Some(entry),
        CacheStatus::Miss => None,
    };
    if req_cc.has("only-if-cached") {
        return (504, Vec::new(), Bytes::new());
    }

    let mut forward: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(n, _)| !HOP_BY_HOP.iter().any(|h| n.eq_ignore_ascii_case(h)))
        .cloned()
        .collect();
    let revalidating = stale.filter(|e| e.etag().is_some() || e.last_modified().is_some());
    if let Some(entry) = &revalidating {
        if let Some(etag) = entry.etag() {
            forward.push(("If-None-Match".into(), etag.to_string()));
        }
        if let Some(lm) = entry.last_modified() {
            forward.push(("If-Modified-Since".into(), lm.to_string()));
        }
    }

    let upstream = match fetch(shared.origin, &request.method, &request.target, &forward).await {
        Ok(resp) => resp,
        Err(_) => return (502, Vec::new(), Bytes::new()),
    };

    let now = shared.clock.now();
    if let (304, Some(entry)) = (upstream.status, &revalidating) {
        let headers = if shared.keep_stale_headers_on_304.load(Ordering::SeqCst) {
            entry.headers.clone()
        } else {
            freshen(&entry.headers, &upstream.headers)
        };
        let updated = CacheEntry {
            status: entry.status,
            headers,
            body: entry.body.clone(),
            stored_at: now,
        };
        shared.cache.lock().unwrap().store(&key, updated.clone());
        let age = updated.current_age(now);
        return reply_from(&updated, age);
    }

    let entry = CacheEntry {
        status: upstream.status,
        headers: strip_hop_by_hop(&upstream.headers),
        body: upstream.body,
        stored_at: now,
    };
    if request.method == "GET" && !req_cc.has("no-store") {
        shared.cache.lock().unwrap().store(&key, entry.clone());
    }
    (entry.status, entry.headers, entry.body)
}

struct Upstream {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

async fn fetch(origin: SocketAddr, method: &str, target: &str, headers: &[(String, String)]) -> cache_tests::Result<Upstream> {
    let stream = TcpStream::connect(origin).await?;
    let mut conn = H1Connection::new(stream);
    let method = Method::from_bytes(method.as_bytes()).unwrap_or(Method::GET);
    let resp = conn
        .send_request(&method, &RequestTarget::Origin(target.to_string()), &origin.to_string(), headers, None)
        .await?;
    Ok(Upstream {
        status: resp.status,
        headers: resp.headers.clone(),
        body: resp.into_body(),
    })
}

fn strip_hop_by_hop(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(n, _)| !HOP_BY_HOP.iter().any(|h| n.eq_ignore_ascii_case(h)))
        .cloned()
        .collect()
}

fn reply_from(entry: &CacheEntry, age: i64) -> (u16, Vec<(String, String)>, Bytes) {
    let mut headers: Vec<(String, String)> = strip_hop_by_hop(&entry.headers)
        .into_iter()
        .filter(|(n, _)| !n.eq_ignore_ascii_case("age"))
        .collect();
    headers.push(("Age".into(), age.to_string()));
    (entry.status, headers, entry.body.clone())
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) -> std::io::Result<()> {
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    stream.write_all(&out).await?;
    stream.flush().await
}
