//! HTTP health probes.
//!
//! Performs HTTP GET checks against each target of a group. A 2xx answer
//! is healthy, any other status is unhealthy, and a connection error or
//! timeout is a failed probe.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::debug;

use cutover_routing::Target;

use crate::checker::ProbeResult;
use crate::error::{HealthError, HealthResult};
use crate::source::HealthSource;

/// `HealthSource` that probes targets over HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpHealthSource {
    path: String,
    timeout: Duration,
}

impl HttpHealthSource {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            timeout,
        }
    }
}

impl Default for HttpHealthSource {
    fn default() -> Self {
        Self::new("/healthz", Duration::from_secs(2))
    }
}

#[async_trait]
impl HealthSource for HttpHealthSource {
    async fn probe(&self, group: &str, targets: &[Target]) -> HealthResult<Vec<ProbeResult>> {
        let mut probes = JoinSet::new();
        for target in targets {
            let address = target.endpoint();
            let path = self.path.clone();
            let timeout = self.timeout;
            probes.spawn(async move { http_probe(&address, &path, timeout).await });
        }

        let mut results = Vec::with_capacity(targets.len());
        while let Some(joined) = probes.join_next().await {
            let result = joined.map_err(|e| HealthError::Probe(e.to_string()))?;
            results.push(result);
        }
        debug!(group, probed = results.len(), "http probes finished");
        Ok(results)
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "cutover-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "invalid health probe request");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
