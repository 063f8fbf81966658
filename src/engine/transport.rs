use bytes::Bytes;
use futures::stream::BoxStream;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("{0}")]
    Other(String),
}

/// Incrementally delivered response body.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Bytes handed to the connection so far, out of the payload total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

/// The three remote operations the engine measures against.
///
/// Futures are dropped on cancellation, so implementations must abort any
/// in-flight request when that happens.
pub trait Transport: Send + Sync + 'static {
    /// One uncached round trip to the ping endpoint.
    fn probe(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Starts an uncached download of `bytes` bytes and returns its body stream.
    fn download(&self, bytes: u64)
        -> impl Future<Output = Result<ByteStream, TransportError>> + Send;

    /// Sends `payload` in a single request, reporting progress as it goes.
    /// Any non-2xx status is an error.
    fn upload<F>(
        &self,
        payload: Bytes,
        on_progress: F,
    ) -> impl Future<Output = Result<(), TransportError>> + Send
    where
        F: Fn(UploadProgress) + Send + Sync + 'static;
}
