//! Stream wrapper that counts archive bytes and logs upload progress.

use super::progress::UploadProgress;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};
use tracing::info;

/// How often progress lines are logged.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

pub struct ProgressStream<S> {
    inner: S,
    label: String,
    transferred: Arc<AtomicU64>,
    progress: UploadProgress,
    last_report: Instant,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    /// `transferred` is shared with the caller, which reads the final count.
    pub fn new(
        inner: S,
        label: impl Into<String>,
        total_bytes: Option<u64>,
        transferred: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            label: label.into(),
            transferred,
            progress: UploadProgress::new(total_bytes),
            last_report: Instant::now(),
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let total = self
                    .transferred
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed)
                    + bytes.len() as u64;

                let now = Instant::now();
                if now.duration_since(self.last_report) >= REPORT_INTERVAL {
                    self.progress.update(total);
                    info!("Uploading {}: {}", self.label, self.progress.describe());
                    self.last_report = now;
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(None) => {
                let total = self.transferred.load(Ordering::Relaxed);
                self.progress.update(total);
                info!(
                    "Read {} of {} in {:.1}s",
                    super::progress::format_bytes(total),
                    self.label,
                    self.progress.elapsed().as_secs_f64()
                );
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    #[tokio::test]
    async fn test_counts_every_chunk() {
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let counter = Arc::new(AtomicU64::new(0));
        let mut stream = ProgressStream::new(stream::iter(chunks), "test.txt", Some(11), counter.clone());

        let mut seen = Vec::new();
        while let Some(chunk) = stream.next().await {
            seen.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(seen, b"hello world");
        assert_eq!(counter.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn test_passes_errors_through() {
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Err(std::io::Error::other("disk gone"))];
        let counter = Arc::new(AtomicU64::new(0));
        let mut stream = ProgressStream::new(stream::iter(chunks), "x", None, counter.clone());

        assert!(stream.next().await.unwrap().is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
