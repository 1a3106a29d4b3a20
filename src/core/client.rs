// src/core/client.rs

//! Network capabilities consumed by analyzers: HTTP fetches, TLS dials and
//! host resolution. The traits keep analyzers testable; the structs below are
//! the production implementations.

use std::borrow::Cow;
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use native_tls::TlsConnector;
use reqwest::header::HeaderMap;
use thiserror::Error;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info};
use url::Url;

const USER_AGENT: &str = concat!("VanguardBP/", env!("CARGO_PKG_VERSION"));

/// Bodies larger than this are cut off before analysis.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tls connection failed: {0}")]
    Tls(String),

    #[error("could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Certificates presented by the peer, leaf first, DER encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsState {
    pub peer_certificates: Vec<Vec<u8>>,
}

impl TlsState {
    pub fn leaf(&self) -> Option<&[u8]> {
        self.peer_certificates.first().map(Vec::as_slice)
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Present when the final hop was served over TLS.
    pub tls: Option<Arc<TlsState>>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The body decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// GETs `url`, following redirects.
    async fn get(&self, url: &Url) -> Result<HttpResponse, ClientError>;
}

#[async_trait]
pub trait TlsDial: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<TlsState, ClientError>;
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ClientError>;
}

// --- reqwest ---

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .tls_info(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn get(&self, url: &Url) -> Result<HttpResponse, ClientError> {
        debug!(url = %url, "Sending GET request.");
        let mut response = self.client.get(url.clone()).send().await.map_err(|e| {
            debug!(url = %url, error = %e, "HTTP request failed.");
            e
        })?;

        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let tls = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(|der| {
                Arc::new(TlsState {
                    peer_certificates: vec![der.to_vec()],
                })
            });

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if !append_capped(&mut body, &chunk, MAX_BODY_BYTES) {
                debug!(url = %final_url, limit = MAX_BODY_BYTES, "Body truncated.");
                break;
            }
        }

        info!(url = %final_url, status, "Received HTTP response.");
        Ok(HttpResponse {
            url: final_url,
            status,
            headers,
            body,
            tls,
        })
    }
}

/// Appends as much of `chunk` as fits under `cap`. Returns whether more is wanted.
fn append_capped(body: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(body.len());
    body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    body.len() < cap
}

// --- native-tls ---

/// Dials with the platform TLS stack on a blocking thread.
pub struct NativeTlsDialer {
    timeout: Duration,
}

impl NativeTlsDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TlsDial for NativeTlsDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<TlsState, ClientError> {
        let host_owned = host.to_string();
        let timeout = self.timeout;
        debug!(host, port, "Spawning blocking task for TLS connection.");
        spawn_blocking(move || perform_tls_handshake(&host_owned, port, timeout)).await?
    }
}

fn perform_tls_handshake(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TlsState, ClientError> {
    let connector = TlsConnector::new().map_err(|e| {
        error!(error = %e, "Failed to create TlsConnector");
        ClientError::Tls(e.to_string())
    })?;

    let address = (host, port)
        .to_socket_addrs()
        .map_err(|e| ClientError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ClientError::Resolve {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        })?;

    debug!(host, %address, "Connecting TCP stream.");
    let stream = TcpStream::connect_timeout(&address, timeout)
        .map_err(|e| ClientError::Tls(format!("TCP connection error: {e}")))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| ClientError::Tls(e.to_string()))?;

    debug!(host, "Performing TLS handshake.");
    let stream = connector
        .connect(host, stream)
        .map_err(|e| ClientError::Tls(format!("TLS handshake error: {e}")))?;

    let peer_certificates = match stream.peer_certificate() {
        Ok(Some(cert)) => vec![cert.to_der().map_err(|e| ClientError::Tls(e.to_string()))?],
        Ok(None) => {
            debug!(host, "TLS connection successful, but no peer certificate provided.");
            Vec::new()
        }
        Err(e) => return Err(ClientError::Tls(e.to_string())),
    };

    Ok(TlsState { peer_certificates })
}

// --- hickory ---

pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for HickoryResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ClientError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ClientError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(lookup.iter().collect())
    }
}
