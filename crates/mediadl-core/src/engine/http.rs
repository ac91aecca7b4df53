//! HTTP transfer engine
//!
//! One worker task per transfer streams the response body to a temp file:
//! a `Range` request continues a partial temp file without re-fetching
//! received bytes, chunked writes go straight to disk, and progress events
//! are throttled to an interval rather than emitted per chunk.
//!
//! Suspension parks the worker between chunks and keeps the connection
//! open, so in-flight bytes are not discarded. A server that drops a
//! long-suspended connection surfaces as a failure on resume; the next
//! start of the same identifier picks the temp file back up via `Range`.

use crate::engine::transfer::{TransferEngine, TransferEvent, TransferHandle};
use crate::error::DownloadError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use url::Url;

/// Minimum interval between progress events for one transfer.
const PROGRESS_INTERVAL_MS: u128 = 250;

/// Control block shared between a handle and its worker.
struct TransferControl {
    suspended: AtomicBool,
    cancelled: AtomicBool,
    wake: Notify,
}

impl TransferControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            suspended: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }
}

struct HttpTransferHandle {
    control: Arc<TransferControl>,
}

impl TransferHandle for HttpTransferHandle {
    fn resume(&self) {
        self.control.suspended.store(false, Ordering::Release);
        self.control.wake.notify_one();
    }

    fn suspend(&self) {
        self.control.suspended.store(true, Ordering::Release);
    }

    fn cancel(&self) {
        self.control.cancelled.store(true, Ordering::Release);
        self.control.wake.notify_one();
    }
}

/// Reqwest-backed transfer engine.
pub struct HttpTransferEngine {
    client: Client,
    temp_dir: PathBuf,
    event_tx: mpsc::UnboundedSender<TransferEvent>,
}

impl HttpTransferEngine {
    /// Create an engine writing temp files under `temp_dir` and reporting
    /// events on `event_tx`.
    pub fn new(
        temp_dir: PathBuf,
        event_tx: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Self, DownloadError> {
        // Connect timeout only. Transfers are long-lived and stall
        // handling is left to the transport.
        let client = Client::builder()
            .user_agent(concat!("mediadl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DownloadError::Transfer(e.to_string()))?;

        Ok(Self {
            client,
            temp_dir,
            event_tx,
        })
    }
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    async fn open(
        &self,
        identifier: &str,
        url: Url,
    ) -> Result<Box<dyn TransferHandle>, DownloadError> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let control = TransferControl::new();
        let worker = TransferWorker {
            identifier: identifier.to_string(),
            url,
            temp_path: self.temp_dir.join(format!("{identifier}.part")),
            client: self.client.clone(),
            event_tx: self.event_tx.clone(),
            control: Arc::clone(&control),
        };
        tokio::spawn(worker.run());

        Ok(Box::new(HttpTransferHandle { control }))
    }
}

/// Streams one transfer to its temp file.
struct TransferWorker {
    identifier: String,
    url: Url,
    temp_path: PathBuf,
    client: Client,
    event_tx: mpsc::UnboundedSender<TransferEvent>,
    control: Arc<TransferControl>,
}

impl TransferWorker {
    async fn run(self) {
        match self.stream().await {
            Ok(Some(temp_path)) => {
                info!("Transfer {} finished", self.identifier);
                let _ = self.event_tx.send(TransferEvent::Finished {
                    identifier: self.identifier.clone(),
                    temp_path,
                });
            }
            Ok(None) => {
                debug!("Transfer {} cancelled", self.identifier);
            }
            Err(e) => {
                warn!("Transfer {} failed: {e}", self.identifier);
                let _ = self.event_tx.send(TransferEvent::Failed {
                    identifier: self.identifier.clone(),
                    cause: e.to_string(),
                });
            }
        }
    }

    /// Returns the temp path on completion, `None` when cancelled.
    async fn stream(&self) -> Result<Option<PathBuf>, DownloadError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&self.temp_path)
            .await?;

        let mut offset = file.metadata().await?.len();
        let request = if offset > 0 {
            debug!(
                "Transfer {} resuming from byte {offset}",
                self.identifier
            );
            self.client
                .get(self.url.clone())
                .header(RANGE, format!("bytes={offset}-"))
        } else {
            self.client.get(self.url.clone())
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Transfer(format!(
                "server returned {status}"
            )));
        }

        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            // Server ignored the range request, start over.
            debug!("Transfer {} restarting from byte 0", self.identifier);
            file.set_len(0).await?;
            file.seek(std::io::SeekFrom::Start(0)).await?;
            offset = 0;
        } else if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }

        let bytes_expected = total_size(&response, offset);

        let mut stream = response.bytes_stream();
        let mut bytes_written = offset;
        let mut last_emit = tokio::time::Instant::now();

        while let Some(chunk) = stream.next().await {
            loop {
                if self.control.cancelled.load(Ordering::Acquire) {
                    let _ = tokio::fs::remove_file(&self.temp_path).await;
                    return Ok(None);
                }
                if !self.control.suspended.load(Ordering::Acquire) {
                    break;
                }
                self.control.wake.notified().await;
            }

            let chunk = chunk?;
            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;

            if last_emit.elapsed().as_millis() >= PROGRESS_INTERVAL_MS {
                let _ = self.event_tx.send(TransferEvent::Progress {
                    identifier: self.identifier.clone(),
                    bytes_written,
                    bytes_expected,
                });
                last_emit = tokio::time::Instant::now();
            }
        }

        // A cancel that raced the last chunks still wins.
        if self.control.cancelled.load(Ordering::Acquire) {
            let _ = tokio::fs::remove_file(&self.temp_path).await;
            return Ok(None);
        }

        file.flush().await?;
        file.sync_all().await?;

        // Final report so the observer is current before the finish event.
        let _ = self.event_tx.send(TransferEvent::Progress {
            identifier: self.identifier.clone(),
            bytes_written,
            bytes_expected,
        });

        Ok(Some(self.temp_path.clone()))
    }
}

/// Total transfer size from response headers, if the server told us.
///
/// A 206 carries `Content-Range: bytes N-M/TOTAL`; a 200 carries the full
/// size in `Content-Length`, to which a resume offset must be added.
fn total_size(response: &reqwest::Response, offset: u64) -> Option<u64> {
    if response.status() == StatusCode::PARTIAL_CONTENT {
        if let Some(total) = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total)
        {
            return Some(total);
        }
    }

    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| offset + len)
}

/// Parse the total out of a `Content-Range` value such as
/// `bytes 100-1023/1024`. An unknown total (`*`) yields `None`.
fn content_range_total(value: &str) -> Option<u64> {
    value.split('/').next_back()?.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parses_known_size() {
        assert_eq!(content_range_total("bytes 100-1023/1024"), Some(1024));
        assert_eq!(content_range_total("bytes 0-0/1"), Some(1));
    }

    #[test]
    fn content_range_total_rejects_unknown_size() {
        assert_eq!(content_range_total("bytes 100-1023/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }
}
