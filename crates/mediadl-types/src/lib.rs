//! Shared types for mediadl
//!
//! This crate contains the data model shared between the core library and
//! any embedding application: download records, statuses, and the events
//! the manager pushes to its observer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// No transfer is associated with the identifier.
    None,
    Downloading,
    Paused,
    Downloaded,
}

/// One logical download, keyed by a caller-supplied identifier.
///
/// A record lives in exactly one of the manager's two tables: in-progress
/// (`Downloading`/`Paused`) or completed (`Downloaded`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub identifier: String,
    pub status: DownloadStatus,
    /// Integer percentage, 0-100 inclusive.
    pub progress: u8,
    /// Source URL.
    pub remote_path: String,
    /// Destination on disk, populated once the download has completed.
    pub local_path: Option<PathBuf>,
}

impl DownloadRecord {
    /// Create a fresh in-progress record.
    pub fn new(identifier: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            status: DownloadStatus::Downloading,
            progress: 0,
            remote_path: remote_path.into(),
            local_path: None,
        }
    }
}

/// Events pushed to the registered observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    /// Fired on finished and failed transitions and on pause/resume.
    StatusChanged {
        identifier: String,
        progress: u8,
        status: DownloadStatus,
        error: Option<String>,
    },
    /// Fired for each progress report from the transfer engine.
    Progress { identifier: String, percent: u8 },
}
