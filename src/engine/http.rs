use crate::engine::transport::{ByteStream, Transport, TransportError, UploadProgress};
use crate::model::EngineConfig;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{stream, stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, PRAGMA};
use reqwest::Url;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

/// Chunk size for upload stream generation (64 KB)
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

const PING_PATH: &str = "/api/ping/";
const DOWNLOAD_PATH: &str = "/api/download/";
const UPLOAD_PATH: &str = "/api/upload/";

#[derive(Clone)]
pub struct HttpTransport {
    pub base_url: Url,
    pub http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(cfg: &EngineConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid base_url")?;

        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        let mut builder = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(15));

        if let Some(ref source_ip) = cfg.source_ip {
            let ip = source_ip
                .parse::<std::net::IpAddr>()
                .with_context(|| format!("invalid source IP address '{}'", source_ip))?;
            builder = builder.local_address(ip);
            tracing::info!(%ip, "binding HTTP connections to source address");
        }

        if let Some(ref cert_path) = cfg.certificate_path {
            let ext = cert_path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase());

            let valid_extensions = ["pem", "crt", "cer", "der"];
            match ext.as_deref() {
                Some(e) if valid_extensions.contains(&e) => {}
                _ => {
                    return Err(anyhow::anyhow!(
                        "certificate file must have one of these extensions: {}",
                        valid_extensions.join(", ")
                    ))
                }
            }

            let cert_data = std::fs::read(cert_path).with_context(|| {
                format!("failed to read certificate from {}", cert_path.display())
            })?;

            let cert = match ext.as_deref() {
                Some("der") => reqwest::Certificate::from_der(&cert_data),
                _ => reqwest::Certificate::from_pem(&cert_data),
            }
            .with_context(|| format!("failed to parse certificate from {}", cert_path.display()))?;

            builder = builder.add_root_certificate(cert);
        }

        let http = builder.build().context("failed to build http client")?;

        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::Other(format!("bad endpoint {path}: {e}")))
    }

    pub fn ping_url(&self) -> Result<Url, TransportError> {
        self.endpoint(PING_PATH)
    }

    pub fn download_url(&self, bytes: u64) -> Result<Url, TransportError> {
        let mut url = self.endpoint(DOWNLOAD_PATH)?;
        url.query_pairs_mut()
            .append_pair("size", &bytes.to_string());
        Ok(url)
    }

    pub fn upload_url(&self) -> Result<Url, TransportError> {
        self.endpoint(UPLOAD_PATH)
    }
}

/// Splits `payload` into body chunks that report progress as each one is
/// handed to the connection. Bytes are counted as they are *produced* for
/// reqwest, which is a close approximation of bytes put on the wire.
fn progress_chunks<F>(
    payload: Bytes,
    on_progress: F,
) -> BoxStream<'static, Result<Bytes, std::io::Error>>
where
    F: Fn(UploadProgress) + Send + Sync + 'static,
{
    let total = payload.len() as u64;
    let sent = Arc::new(AtomicU64::new(0));
    let on_progress = Arc::new(on_progress);

    let chunks: Vec<Bytes> = (0..payload.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| payload.slice(start..(start + UPLOAD_CHUNK_SIZE).min(payload.len())))
        .collect();

    stream::iter(chunks)
        .map(move |chunk| {
            let now = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            on_progress(UploadProgress { sent: now, total });
            Ok::<Bytes, std::io::Error>(chunk)
        })
        .boxed()
}

impl Transport for HttpTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let resp = self.http.get(self.ping_url()?).send().await?;
        // Any status still counts as a completed round trip.
        let _ = resp.bytes().await;
        Ok(())
    }

    async fn download(&self, bytes: u64) -> Result<ByteStream, TransportError> {
        let resp = self.http.get(self.download_url(bytes)?).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(resp.bytes_stream().map_err(TransportError::from).boxed())
    }

    async fn upload<F>(&self, payload: Bytes, on_progress: F) -> Result<(), TransportError>
    where
        F: Fn(UploadProgress) + Send + Sync + 'static,
    {
        let len = payload.len();
        let resp = self
            .http
            .post(self.upload_url()?)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(progress_chunks(payload, on_progress)))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        // The upload only counts once the acknowledgement body has arrived.
        resp.bytes().await?;
        Ok(())
    }
}
