//! Scripted transport for exercising the engine without a server.

use crate::engine::transport::{ByteStream, Transport, TransportError, UploadProgress};
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Probe {
    Reply(Duration),
    Fail(Duration),
}

pub(crate) struct MockTransport {
    probes: Mutex<VecDeque<Probe>>,
    chunk_size: usize,
    chunks_per_stream: usize,
    chunk_delay: Duration,
    slow_streams: usize,
    slow_delay: Duration,
    failing_streams: usize,
    truncated_streams: usize,
    upload_steps: u64,
    upload_step_delay: Duration,
    upload_status: u16,
    download_calls: AtomicUsize,
    requested: Mutex<Vec<u64>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            probes: Mutex::new(VecDeque::new()),
            chunk_size: 1024,
            chunks_per_stream: 1,
            chunk_delay: Duration::from_millis(10),
            slow_streams: 0,
            slow_delay: Duration::ZERO,
            failing_streams: 0,
            truncated_streams: 0,
            upload_steps: 1,
            upload_step_delay: Duration::from_millis(10),
            upload_status: 200,
            download_calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Probes answered in order; once exhausted every probe replies after 10ms.
    pub(crate) fn with_probes(self, probes: Vec<Probe>) -> Self {
        *self.probes.lock().unwrap() = probes.into();
        self
    }

    pub(crate) fn with_download(mut self, chunk_size: usize, chunks: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.chunks_per_stream = chunks;
        self.chunk_delay = delay;
        self
    }

    /// The first `n` download requests deliver each chunk after `delay` instead.
    pub(crate) fn slow_streams(mut self, n: usize, delay: Duration) -> Self {
        self.slow_streams = n;
        self.slow_delay = delay;
        self
    }

    /// The first `n` download requests fail before returning a body.
    pub(crate) fn failing_streams(mut self, n: usize) -> Self {
        self.failing_streams = n;
        self
    }

    /// The next `n` download requests break after their first chunk.
    pub(crate) fn truncated_streams(mut self, n: usize) -> Self {
        self.truncated_streams = n;
        self
    }

    pub(crate) fn with_upload(mut self, steps: u64, delay: Duration) -> Self {
        self.upload_steps = steps;
        self.upload_step_delay = delay;
        self
    }

    pub(crate) fn upload_status(mut self, status: u16) -> Self {
        self.upload_status = status;
        self
    }

    pub(crate) fn requested_sizes(&self) -> Vec<u64> {
        self.requested.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let next = self.probes.lock().unwrap().pop_front();
        match next.unwrap_or(Probe::Reply(Duration::from_millis(10))) {
            Probe::Reply(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Probe::Fail(delay) => {
                tokio::time::sleep(delay).await;
                Err(TransportError::Other("connection refused".into()))
            }
        }
    }

    async fn download(&self, bytes: u64) -> Result<ByteStream, TransportError> {
        self.requested.lock().unwrap().push(bytes);
        let call = self.download_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failing_streams {
            return Err(TransportError::Status(503));
        }
        let truncated = call < self.failing_streams + self.truncated_streams;
        let delay = if call < self.slow_streams {
            self.slow_delay
        } else {
            self.chunk_delay
        };

        let chunk = Bytes::from(vec![0u8; self.chunk_size]);
        let body = stream::iter(0..self.chunks_per_stream).then(move |i| {
            let chunk = chunk.clone();
            async move {
                tokio::time::sleep(delay).await;
                if truncated && i > 0 {
                    Err(TransportError::Other("connection reset".into()))
                } else {
                    Ok(chunk)
                }
            }
        });
        Ok(body.boxed())
    }

    async fn upload<F>(&self, payload: Bytes, on_progress: F) -> Result<(), TransportError>
    where
        F: Fn(UploadProgress) + Send + Sync + 'static,
    {
        let total = payload.len() as u64;
        let steps = self.upload_steps.max(1);
        for i in 1..=steps {
            tokio::time::sleep(self.upload_step_delay).await;
            on_progress(UploadProgress {
                sent: total * i / steps,
                total,
            });
        }
        if (200..300).contains(&self.upload_status) {
            Ok(())
        } else {
            Err(TransportError::Status(self.upload_status))
        }
    }
}
