//! Persistence store for completed downloads
//!
//! One JSON document in a fixed slot under the data directory. Writes are
//! gated by the persistence flag; reads are not, so a run with writes
//! disabled still sees whatever a prior run persisted.

use crate::error::DownloadError;
use mediadl_types::DownloadRecord;
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// File name of the storage slot.
const SLOT_NAME: &str = "downloads.json";

/// Storage for the completed-downloads table.
#[derive(Debug, Clone)]
pub struct Store {
    data_dir: PathBuf,
    enabled: bool,
}

impl Store {
    /// Create a store rooted at `data_dir`, creating the directory if
    /// needed. `enabled` gates writes only.
    pub async fn new(data_dir: PathBuf, enabled: bool) -> Result<Self, DownloadError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir, enabled })
    }

    fn slot_path(&self) -> PathBuf {
        self.data_dir.join(SLOT_NAME)
    }

    /// Write the full completed set to the slot, replacing its previous
    /// contents. A no-op when persistence is disabled.
    pub async fn save(&self, records: &[DownloadRecord]) -> Result<(), DownloadError> {
        if !self.enabled {
            debug!(
                "Persistence disabled, dropping write of {} record(s)",
                records.len()
            );
            return Ok(());
        }

        let content = serde_json::to_string_pretty(records)
            .map_err(|e| DownloadError::Serialization(e.to_string()))?;
        fs::write(self.slot_path(), content).await?;

        Ok(())
    }

    /// Read the slot. Returns `None` when no slot has been written yet.
    pub async fn load(&self) -> Result<Option<Vec<DownloadRecord>>, DownloadError> {
        let content = match fs::read_to_string(self.slot_path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let records = serde_json::from_str(&content)
            .map_err(|e| DownloadError::Serialization(e.to_string()))?;

        Ok(Some(records))
    }
}
