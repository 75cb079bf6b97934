//! Network transports and transport selection
//!
//! Three transport kinds mirror what a browser offers:
//!
//! | Kind | Behaviour | Payload limit |
//! |------|-----------|---------------|
//! | [`TransportKind::Beacon`] | fire-and-forget, no response observed | 64 KiB |
//! | [`TransportKind::Fetch`] | awaits the response; `keep_alive` requests survive unload | 64 KiB with `keep_alive` |
//! | [`TransportKind::Xhr`] | awaits the response | none |
//!
//! Exactly one transport is used per send attempt.

use async_trait::async_trait;
use bon::bon;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// SDK version for User-Agent header
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
const SDK_NAME: &str = env!("CARGO_PKG_NAME");

/// Default timeout for requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest body a beacon or keepalive request may carry
pub const KEEPALIVE_PAYLOAD_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Beacon,
    Fetch,
    Xhr,
}

/// One outbound request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub payload: String,
    pub content_type: &'static str,
    pub headers: Vec<(String, String)>,
    /// The request must survive the host going away
    pub keep_alive: bool,
}

/// What a transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResponse {
    /// A response arrived
    Completed {
        status: u16,
        body: Option<String>,
        retry_after: Option<Duration>,
    },
    /// Handed off without a response (beacon)
    Queued,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the transport can be used in this environment at all
    fn is_available(&self) -> bool {
        true
    }

    /// Largest payload accepted for a request with the given `keep_alive`
    fn payload_limit(&self, keep_alive: bool) -> Option<usize> {
        let _ = keep_alive;
        None
    }

    /// Send one request. An `Err` means no response was observed.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// reqwest-backed transport usable as any of the three kinds
pub struct HttpTransport {
    client: reqwest::Client,
    kind: TransportKind,
}

/// HTTP client with the channel's timeouts, pool settings and User-Agent
pub fn http_client(
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
) -> reqwest::Client {
    // Construct User-Agent with SDK info
    let user_agent = user_agent.unwrap_or_else(|| format!("{}/{} (Rust)", SDK_NAME, SDK_VERSION));

    // Build HTTP client with sensible defaults
    reqwest::Client::builder()
        .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
        .connect_timeout(connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
        .user_agent(user_agent)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to default HTTP client");
            reqwest::Client::new()
        })
}

#[bon]
impl HttpTransport {
    #[builder]
    pub fn new(
        kind: TransportKind,
        timeout: Option<Duration>,
        connect_timeout: Option<Duration>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            client: http_client(timeout, connect_timeout, user_agent),
            kind,
        }
    }
}

impl HttpTransport {
    /// Transport sharing an existing client
    pub fn with_client(client: reqwest::Client, kind: TransportKind) -> Self {
        Self { client, kind }
    }

    /// One transport of each kind, sharing a client
    pub fn all(client: reqwest::Client) -> Vec<Arc<dyn Transport>> {
        [TransportKind::Beacon, TransportKind::Fetch, TransportKind::Xhr]
            .into_iter()
            .map(|kind| Arc::new(Self::with_client(client.clone(), kind)) as Arc<dyn Transport>)
            .collect()
    }

    fn request(&self, request: &TransportRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, request.content_type)
            .body(request.payload.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn payload_limit(&self, keep_alive: bool) -> Option<usize> {
        match self.kind {
            TransportKind::Beacon => Some(KEEPALIVE_PAYLOAD_LIMIT),
            TransportKind::Fetch if keep_alive => Some(KEEPALIVE_PAYLOAD_LIMIT),
            _ => None,
        }
    }

    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        if let Some(max_size) = self.payload_limit(request.keep_alive) {
            if request.payload.len() > max_size {
                return Err(Error::PayloadTooLarge {
                    size: request.payload.len(),
                    max_size,
                });
            }
        }

        let builder = self.request(&request);

        if self.kind == TransportKind::Beacon {
            // Nobody waits for a beacon
            tokio::spawn(async move {
                if let Err(e) = builder.send().await {
                    tracing::debug!(error = %e, "beacon request failed");
                }
            });
            return Ok(TransportResponse::Queued);
        }

        let response = builder.send().await.map_err(Error::Network)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.ok().filter(|b| !b.is_empty());

        Ok(TransportResponse::Completed {
            status,
            body,
            retry_after,
        })
    }
}

/// Which transports may be used, from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportPolicy {
    pub is_beacon_api_disabled: bool,
    pub onunload_disable_beacon: bool,
    pub onunload_disable_fetch: bool,
    pub disable_xhr: bool,
}

impl TransportPolicy {
    /// Kinds to try, best first
    pub fn preference(&self, unload: bool) -> Vec<TransportKind> {
        let mut kinds = Vec::with_capacity(3);
        if unload {
            if !self.is_beacon_api_disabled && !self.onunload_disable_beacon {
                kinds.push(TransportKind::Beacon);
            }
            if !self.onunload_disable_fetch {
                kinds.push(TransportKind::Fetch);
            }
        } else {
            kinds.push(TransportKind::Fetch);
        }
        if !self.disable_xhr {
            kinds.push(TransportKind::Xhr);
        }
        kinds
    }

    /// Usable transports for a payload of `payload_size` bytes, best first
    pub fn select(
        &self,
        transports: &[Arc<dyn Transport>],
        unload: bool,
        payload_size: usize,
    ) -> Vec<Arc<dyn Transport>> {
        self.preference(unload)
            .into_iter()
            .filter_map(|kind| {
                transports.iter().find(|t| {
                    t.kind() == kind
                        && t.is_available()
                        && t.payload_limit(unload).is_none_or(|max| payload_size <= max)
                })
            })
            .cloned()
            .collect()
    }
}
