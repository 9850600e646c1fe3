//! Sends one request through the cache under test and gathers what both ends
//! saw.

use std::time::Instant;

use http::Method;
use tokio::net::TcpStream;

use crate::classify::ObservedExchange;
use crate::config::CacheTarget;
use crate::error::{Error, Result};
use crate::origin::OriginHandle;
use crate::timeouts::{within, Timeouts};
use crate::transport::h1::{H1Connection, RequestTarget};

/// Issues requests; holds no caching logic of its own.
#[derive(Clone)]
pub struct RequestExecutor {
    target: CacheTarget,
    origin: OriginHandle,
    timeouts: Timeouts,
}

impl RequestExecutor {
    pub fn new(target: CacheTarget, origin: OriginHandle, timeouts: Timeouts) -> Self {
        Self { target, origin, timeouts }
    }

    pub fn origin(&self) -> &OriginHandle {
        &self.origin
    }

    /// Send a request for `test_id`'s endpoint and capture the exchange.
    ///
    /// The request uses a fresh connection so that no state leaks between
    /// steps or tests.
    pub async fn execute(&self, test_id: &str, method: &Method, headers: &[(String, String)]) -> Result<ObservedExchange> {
        let before = self.origin.log_len(test_id).await?;
        let (connect_to, target, host) = self.route(test_id)?;

        let started = Instant::now();
        let stream = within(self.timeouts.connect, Error::ConnectTimeout, async {
            TcpStream::connect(&connect_to)
                .await
                .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", connect_to, e)))
        })
        .await?;
        let _ = stream.set_nodelay(true);

        let mut conn = H1Connection::new(stream);
        let response = within(
            self.timeouts.response,
            Error::ResponseTimeout,
            conn.send_request(method, &target, &host, headers, None),
        )
        .await?;
        let elapsed = started.elapsed();

        let origin = self.origin.exchanges_since(test_id, before).await?.pop();
        let stored = self.origin.last_full_before(test_id, before).await?;
        tracing::debug!(
            "{} {} -> {} in {:?} (origin hit: {})",
            method,
            test_id,
            response.status,
            elapsed,
            origin.is_some()
        );

        Ok(ObservedExchange {
            status: response.status,
            response_headers: response.headers.clone(),
            body: response.into_body(),
            request_method: method.clone(),
            origin,
            stored,
            elapsed,
        })
    }

    /// Address to connect to, request-target, and `Host` value.
    fn route(&self, test_id: &str) -> Result<(String, RequestTarget, String)> {
        let url = self.origin.url_for(test_id)?;
        let origin_authority = authority(&url)?;
        Ok(match &self.target {
            CacheTarget::ForwardProxy { proxy } => {
                (proxy.clone(), RequestTarget::Absolute(url.to_string()), origin_authority)
            }
            CacheTarget::ReverseProxy { cache } => {
                (cache.clone(), RequestTarget::Origin(url.path().to_string()), cache.clone())
            }
            CacheTarget::Direct => (
                origin_authority.clone(),
                RequestTarget::Origin(url.path().to_string()),
                origin_authority,
            ),
        })
    }
}

fn authority(url: &url::Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::connection(format!("Origin URL has no host: {}", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::connection(format!("Origin URL has no port: {}", url)))?;
    Ok(format!("{}:{}", host, port))
}
