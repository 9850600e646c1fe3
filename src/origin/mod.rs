//! Origin test server.
//!
//! Serves one endpoint per test at `/{run-id}/{test-id}`. The runner arms an
//! endpoint with a [`ResponsePlan`] before each step; the server answers
//! whatever reaches it with that plan and records every request. The log is
//! the ground truth for whether the cache contacted the origin.

mod endpoint;

pub use endpoint::{etag_list_matches, ConditionalKind, EndpointState, ResponsePlan, ServedExchange};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::h1::{read_request, RequestHead};

/// Idle time after which a kept-alive origin connection is dropped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type Registry = RwLock<HashMap<String, Arc<Mutex<EndpointState>>>>;

struct Shared {
    run_id: String,
    base_url: Url,
    endpoints: Registry,
}

/// Handle to the origin's endpoint registry, shared with the runner.
#[derive(Clone)]
pub struct OriginHandle {
    shared: Arc<Shared>,
}

impl OriginHandle {
    /// Random per-run nonce prefixed to every endpoint path.
    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    /// Base URL the cache uses to reach the origin.
    pub fn base_url(&self) -> &Url {
        &self.shared.base_url
    }

    pub fn path_for(&self, test_id: &str) -> String {
        format!("/{}/{}", self.shared.run_id, test_id)
    }

    pub fn url_for(&self, test_id: &str) -> Result<Url> {
        Ok(self.shared.base_url.join(&self.path_for(test_id))?)
    }

    /// Default full-response body; unique per run, test and step.
    pub fn default_body(&self, test_id: &str, step: usize) -> Bytes {
        Bytes::from(format!("cache-tests {} {} step {}", self.shared.run_id, test_id, step))
    }

    /// Create the endpoint for a test. Re-registering resets it.
    pub async fn register(&self, test_id: &str) {
        self.shared
            .endpoints
            .write()
            .await
            .insert(self.path_for(test_id), Arc::new(Mutex::new(EndpointState::new())));
    }

    async fn endpoint(&self, test_id: &str) -> Result<Arc<Mutex<EndpointState>>> {
        let path = self.path_for(test_id);
        self.shared
            .endpoints
            .read()
            .await
            .get(&path)
            .cloned()
            .ok_or(Error::UnknownEndpoint(path))
    }

    pub async fn arm(&self, test_id: &str, plan: ResponsePlan) -> Result<()> {
        self.endpoint(test_id).await?.lock().await.arm(plan);
        Ok(())
    }

    /// Number of requests the endpoint has recorded so far.
    pub async fn log_len(&self, test_id: &str) -> Result<usize> {
        Ok(self.endpoint(test_id).await?.lock().await.log().len())
    }

    /// Requests recorded at or after position `from`.
    pub async fn exchanges_since(&self, test_id: &str, from: usize) -> Result<Vec<ServedExchange>> {
        let endpoint = self.endpoint(test_id).await?;
        let state = endpoint.lock().await;
        Ok(state.log().get(from..).map(<[_]>::to_vec).unwrap_or_default())
    }

    /// Last full response served before position `before`: the representation
    /// a cache could be holding.
    pub async fn last_full_before(&self, test_id: &str, before: usize) -> Result<Option<ServedExchange>> {
        let endpoint = self.endpoint(test_id).await?;
        let state = endpoint.lock().await;
        let end = before.min(state.log().len());
        Ok(state.log()[..end].iter().rev().find(|e| e.is_full()).cloned())
    }

    async fn lookup_path(&self, path: &str) -> Option<Arc<Mutex<EndpointState>>> {
        self.shared.endpoints.read().await.get(path).cloned()
    }
}

/// HTTP/1.1 origin server.
pub struct OriginServer {
    listener: TcpListener,
    handle: OriginHandle,
}

impl OriginServer {
    /// Bind the listener and pick a fresh run id.
    ///
    /// `public_url` is how the cache reaches this server; when `None` it is
    /// derived from the bound address.
    pub async fn bind(addr: &str, public_url: Option<Url>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connection(format!("Failed to bind origin on {}: {}", addr, e)))?;
        let local = listener.local_addr()?;
        let base_url = match public_url {
            Some(url) => url,
            None => Url::parse(&format!("http://{}/", reachable(local)))?,
        };
        let run_id = new_run_id()?;
        tracing::info!("origin listening on {} (public {}), run id {}", local, base_url, run_id);

        Ok(Self {
            listener,
            handle: OriginHandle {
                shared: Arc::new(Shared {
                    run_id,
                    base_url,
                    endpoints: RwLock::new(HashMap::new()),
                }),
            },
        })
    }

    pub fn handle(&self) -> OriginHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the accept loop in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!("origin accepted connection from {}", peer);
                        tokio::spawn(handle_connection(stream, self.handle.clone()));
                    }
                    Err(e) => {
                        tracing::error!("Origin accept error: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

/// Serve requests on one connection until the peer closes or goes idle.
async fn handle_connection(mut stream: TcpStream, handle: OriginHandle) {
    let mut buffer = Vec::new();
    loop {
        let head = match timeout(IDLE_TIMEOUT, read_request(&mut stream, &mut buffer)).await {
            Ok(Ok(Some(head))) => head,
            Ok(Ok(None)) | Err(_) => break,
            Ok(Err(e)) => {
                tracing::warn!("origin dropped malformed request: {}", e);
                break;
            }
        };

        let keep_alive = head.keep_alive();
        let (status, headers, body) = answer(&handle, &head).await;
        if let Err(e) = write_response(&mut stream, status, &headers, &body, keep_alive).await {
            tracing::debug!("origin write failed: {}", e);
            break;
        }
        if !keep_alive {
            break;
        }
    }
}

async fn answer(handle: &OriginHandle, head: &RequestHead) -> (u16, Vec<(String, String)>, Bytes) {
    let path = head.path();
    let Some(endpoint) = handle.lookup_path(path).await else {
        tracing::debug!("origin 404 for {}", path);
        let body = Bytes::from_static(b"unknown endpoint");
        return (404, vec![("Content-Length".into(), body.len().to_string())], body);
    };

    let served = endpoint
        .lock()
        .await
        .serve(&head.method, head.headers.clone(), chrono::Utc::now());
    tracing::debug!(
        "origin {} {} step {} -> {} (conditional {:?})",
        head.method,
        path,
        served.step,
        served.status,
        served.conditional
    );
    (served.status, served.headers, served.body)
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    keep_alive: bool,
) -> std::io::Result<()> {
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !keep_alive {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    stream.write_all(&out).await?;
    stream.flush().await
}

/// Unspecified bind addresses are reached through loopback.
fn reachable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    }
}

fn new_run_id() -> Result<String> {
    let mut nonce = [0u8; 8];
    getrandom::fill(&mut nonce).map_err(|e| Error::io(format!("Failed to generate run id: {}", e)))?;
    Ok(nonce.iter().map(|b| format!("{:02x}", b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::h1::{H1Connection, RequestTarget};
    use http::Method;

    async fn get(addr: SocketAddr, path: &str, headers: &[(String, String)]) -> crate::response::Response {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = H1Connection::new(stream);
        conn.send_request(&Method::GET, &RequestTarget::Origin(path.into()), &addr.to_string(), headers, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn serves_armed_plan_and_records_requests() {
        let server = OriginServer::bind("127.0.0.1:0", None).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        server.start();

        handle.register("freshness-none").await;
        handle
            .arm(
                "freshness-none",
                ResponsePlan {
                    step: 0,
                    status: 200,
                    headers: vec![("Cache-Control".into(), "max-age=3600".into())],
                    body: handle.default_body("freshness-none", 0),
                    answer_conditionals: false,
                },
            )
            .await
            .unwrap();

        let resp = get(addr, &handle.path_for("freshness-none"), &[]).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.get_header("cache-control"), Some("max-age=3600"));
        assert!(resp.get_header("date").is_some());
        assert_eq!(
            resp.text().unwrap(),
            format!("cache-tests {} freshness-none step 0", handle.run_id())
        );

        assert_eq!(handle.log_len("freshness-none").await.unwrap(), 1);
        let stored = handle.last_full_before("freshness-none", 1).await.unwrap().unwrap();
        assert_eq!(stored.status, 200);
        assert!(handle.exchanges_since("freshness-none", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_paths_get_404() {
        let server = OriginServer::bind("127.0.0.1:0", None).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        server.start();

        let resp = get(addr, &handle.path_for("never-registered"), &[]).await;
        assert_eq!(resp.status, 404);
        assert!(matches!(
            handle.log_len("never-registered").await,
            Err(Error::UnknownEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn run_ids_differ_between_servers() {
        let a = OriginServer::bind("127.0.0.1:0", None).await.unwrap();
        let b = OriginServer::bind("127.0.0.1:0", None).await.unwrap();
        assert_ne!(a.handle().run_id(), b.handle().run_id());
        assert_eq!(a.handle().run_id().len(), 16);
        assert!(a.handle().url_for("x").unwrap().path().ends_with("/x"));
    }
}
