//! Transfer engine capability boundary

use crate::error::DownloadError;
use async_trait::async_trait;
use std::path::PathBuf;
use url::Url;

/// Asynchronous events reported by a transfer engine, tagged by the
/// identifier the transfer was opened with.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Bytes received so far. `bytes_expected` is `None` until the engine
    /// has determined the total size.
    Progress {
        identifier: String,
        bytes_written: u64,
        bytes_expected: Option<u64>,
    },
    /// The transfer finished; the payload sits at `temp_path` awaiting the
    /// move to its canonical destination.
    Finished {
        identifier: String,
        temp_path: PathBuf,
    },
    /// The transfer failed. Never emitted for a caller-initiated cancel.
    Failed { identifier: String, cause: String },
}

/// Control surface for one in-flight transfer.
pub trait TransferHandle: Send + Sync {
    /// Continue a suspended transfer from its last byte offset.
    fn resume(&self);

    /// Suspend the transfer. Received bytes are kept.
    fn suspend(&self);

    /// Abort the transfer and discard its temporary data.
    fn cancel(&self);
}

/// Capability boundary over the byte-level transfer client.
///
/// Implementations deliver `TransferEvent`s on an unbounded channel handed
/// to them at construction, so a slow consumer never causes event loss.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Begin a transfer for `identifier` from `url`. Progress, completion
    /// and failure are reported asynchronously, tagged with the same
    /// identifier.
    async fn open(
        &self,
        identifier: &str,
        url: Url,
    ) -> Result<Box<dyn TransferHandle>, DownloadError>;
}
