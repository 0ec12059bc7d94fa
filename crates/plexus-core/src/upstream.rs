//! Upstream HTTP client behind a trait so the dispatcher can be driven
//! against a mock in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Proxy};

use crate::config::TimeoutConfig;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub want_stream: bool,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    /// Chunks as they arrive; an `Err` item reports a mid-stream
    /// transport failure, channel close is a clean end.
    Stream(tokio::sync::mpsc::Receiver<Result<Bytes, String>>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamBody,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamFailure {
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error("upstream transport failed: {0}")]
    Transport(String),
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_timeouts(timeouts: &TimeoutConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(timeouts.upstream_connect_secs),
            request_timeout: Duration::from_secs(timeouts.upstream_total_secs),
            stream_idle_timeout: Duration::from_secs(timeouts.stream_idle_secs),
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self::from_timeouts(&TimeoutConfig::default())
    }
}

/// `wreq`-backed client. Two cached clients: the unary one carries the
/// hard total timeout, the streaming one only the idle-read cap.
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    proxy: Option<String>,
    unary: Mutex<Option<Client>>,
    streaming: Mutex<Option<Client>>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig, proxy: Option<String>) -> Self {
        Self {
            config,
            proxy: proxy
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            unary: Mutex::new(None),
            streaming: Mutex::new(None),
        }
    }

    fn client(&self, want_stream: bool) -> Result<Client, UpstreamFailure> {
        let cache = if want_stream { &self.streaming } else { &self.unary };
        let mut guard = cache
            .lock()
            .map_err(|_| UpstreamFailure::Transport("client cache lock poisoned".into()))?;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let mut builder = Client::builder().connect_timeout(self.config.connect_timeout);
        builder = if want_stream {
            builder.read_timeout(self.config.stream_idle_timeout)
        } else {
            builder.timeout(self.config.request_timeout)
        };
        if let Some(proxy) = self.proxy.as_deref() {
            builder = builder
                .proxy(Proxy::all(proxy).map_err(|err| UpstreamFailure::Connect(err.to_string()))?);
        }
        let client = builder
            .build()
            .map_err(|err| UpstreamFailure::Transport(err.to_string()))?;
        *guard = Some(client.clone());
        Ok(client)
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client(request.want_stream)?;
            let mut builder = client.post(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            let response = builder
                .body(request.body)
                .send()
                .await
                .map_err(map_wreq_error)?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            let success = (200..300).contains(&status);
            if !success || !request.want_stream {
                let body = response.bytes().await.map_err(map_wreq_error)?;
                return Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                });
            }

            let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, String>>(16);
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                while let Some(item) = stream.next().await {
                    let outgoing = item.map_err(|err| err.to_string());
                    let failed = outgoing.is_err();
                    if tx.send(outgoing).await.is_err() || failed {
                        break;
                    }
                }
            });
            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    if err.is_timeout() {
        UpstreamFailure::Timeout
    } else if err.is_connect() {
        UpstreamFailure::Connect(err.to_string())
    } else {
        UpstreamFailure::Transport(err.to_string())
    }
}
