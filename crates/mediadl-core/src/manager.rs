//! Download session manager
//!
//! The top-level coordinator: starts and resumes transfers through the
//! engine boundary, applies lifecycle transitions as the engine reports
//! progress and completion, persists the completed table, and republishes
//! events to the registered observer.
//!
//! The manager exclusively owns the in-progress table, the completed table
//! and the identifier-to-handle map. One lock guards all three, so every
//! mutation of a single identifier's state is serialized and no caller can
//! observe a half-applied transition. Observer notification happens after
//! the lock is released.

use crate::engine::{HttpTransferEngine, TransferEngine, TransferEvent, TransferHandle};
use crate::error::DownloadError;
use crate::store::Store;
use mediadl_types::{DownloadEvent, DownloadRecord, DownloadStatus};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

/// Extension appended to the identifier for canonical destinations.
const DOWNLOAD_EXTENSION: &str = "mp4";

/// Configuration for the download manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding the persistence slot and transfer temp files.
    pub data_dir: PathBuf,
    /// Base directory for completed files. `None` re-resolves the platform
    /// downloads directory on every access.
    pub download_dir: Option<PathBuf>,
    /// Gates persistence writes only; loads are unaffected.
    pub persist_completed: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .map(|p| p.join("mediadl"))
                .unwrap_or_else(|| PathBuf::from(".")),
            download_dir: None,
            persist_completed: true,
        }
    }
}

/// Tables owned exclusively by the manager.
#[derive(Default)]
struct ManagerState {
    in_progress: Vec<DownloadRecord>,
    completed: Vec<DownloadRecord>,
    handles: HashMap<String, Box<dyn TransferHandle>>,
}

/// Download session manager. Construct with [`DownloadManager::new`] for
/// the HTTP engine or [`DownloadManager::with_engine`] for a custom one.
pub struct DownloadManager {
    state: Mutex<ManagerState>,
    engine: Arc<dyn TransferEngine>,
    store: Store,
    observer: parking_lot::Mutex<Option<mpsc::UnboundedSender<DownloadEvent>>>,
    download_dir: Option<PathBuf>,
}

impl DownloadManager {
    /// Create a manager backed by the HTTP transfer engine.
    pub async fn new(config: ManagerConfig) -> Result<Arc<Self>, DownloadError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine: Arc<dyn TransferEngine> = Arc::new(HttpTransferEngine::new(
            config.data_dir.join("temp"),
            event_tx,
        )?);

        Self::with_engine(config, engine, event_rx).await
    }

    /// Create a manager on top of an arbitrary transfer engine. `events`
    /// must be the receiving end of the engine's event channel.
    ///
    /// The persisted completed table is loaded exactly once, here; an
    /// absent slot yields an empty table.
    pub async fn with_engine(
        config: ManagerConfig,
        engine: Arc<dyn TransferEngine>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
    ) -> Result<Arc<Self>, DownloadError> {
        let store = Store::new(config.data_dir.clone(), config.persist_completed).await?;
        let completed = store.load().await?.unwrap_or_default();
        info!("Loaded {} completed download(s)", completed.len());

        let manager = Arc::new(Self {
            state: Mutex::new(ManagerState {
                completed,
                ..Default::default()
            }),
            engine,
            store,
            observer: parking_lot::Mutex::new(None),
            download_dir: config.download_dir,
        });

        // Pump engine events into the state machine. Holding a weak
        // reference lets the task die with the manager.
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.handle_event(event).await;
            }
        });

        Ok(manager)
    }

    /// Register the observer, replacing any previous registration. Events
    /// arrive in order on the returned channel; the channel is unbounded,
    /// so a slow observer never blocks event processing.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.observer.lock() = Some(tx);
        rx
    }

    /// Snapshot of every known download: in-progress entries first, then
    /// completed ones, each table in insertion order. Never fails.
    pub async fn list_all(&self) -> Vec<DownloadRecord> {
        let state = self.state.lock().await;
        state
            .in_progress
            .iter()
            .chain(state.completed.iter())
            .cloned()
            .collect()
    }

    /// Start a new download or resume a suspended one.
    ///
    /// An existing handle is resumed in place: status flips to
    /// `Downloading`, progress is left at its last known value, and the
    /// transport continues from its actual byte offset. Repeated calls
    /// while already downloading are idempotent. Without a handle, the
    /// remote path is validated and a fresh transfer is opened.
    pub async fn start_or_resume(
        &self,
        identifier: &str,
        remote_path: &str,
    ) -> Result<DownloadRecord, DownloadError> {
        let mut state = self.state.lock().await;

        if state.handles.contains_key(identifier) {
            let record = state
                .in_progress
                .iter_mut()
                .find(|r| r.identifier == identifier)
                .map(|r| {
                    r.status = DownloadStatus::Downloading;
                    r.clone()
                })
                .unwrap_or_else(|| DownloadRecord::new(identifier, remote_path));
            if let Some(handle) = state.handles.get(identifier) {
                handle.resume();
            }
            drop(state);

            info!("Resumed download {identifier}");
            self.notify(DownloadEvent::StatusChanged {
                identifier: identifier.to_string(),
                progress: record.progress,
                status: record.status,
                error: None,
            });
            return Ok(record);
        }

        // An identifier with a completed record is already on disk; hand
        // the record back instead of opening a second transfer for it.
        // Re-downloading requires an explicit remove() first.
        if let Some(record) = state
            .completed
            .iter()
            .find(|r| r.identifier == identifier)
        {
            debug!("Download {identifier} already completed");
            return Ok(record.clone());
        }

        let url = Url::parse(remote_path)
            .map_err(|_| DownloadError::InvalidRemotePath(remote_path.to_string()))?;

        let handle = self.engine.open(identifier, url).await?;
        let record = DownloadRecord::new(identifier, remote_path);
        state.handles.insert(identifier.to_string(), handle);
        state.in_progress.push(record.clone());
        drop(state);

        info!("Started download {identifier} from {remote_path}");
        self.notify(DownloadEvent::StatusChanged {
            identifier: identifier.to_string(),
            progress: 0,
            status: DownloadStatus::Downloading,
            error: None,
        });
        Ok(record)
    }

    /// Suspend a live transfer, preserving its received bytes and last
    /// known progress. Fails with `NotFound` when no handle exists.
    pub async fn pause(&self, identifier: &str) -> Result<DownloadRecord, DownloadError> {
        let mut state = self.state.lock().await;

        if !state.handles.contains_key(identifier) {
            return Err(DownloadError::NotFound(identifier.to_string()));
        }
        let record = state
            .in_progress
            .iter_mut()
            .find(|r| r.identifier == identifier)
            .ok_or_else(|| DownloadError::NotFound(identifier.to_string()))?;
        record.status = DownloadStatus::Paused;
        let record = record.clone();
        if let Some(handle) = state.handles.get(identifier) {
            handle.suspend();
        }
        drop(state);

        info!("Paused download {identifier} at {}%", record.progress);
        self.notify(DownloadEvent::StatusChanged {
            identifier: identifier.to_string(),
            progress: record.progress,
            status: DownloadStatus::Paused,
            error: None,
        });
        Ok(record)
    }

    /// Delete a completed download: backing file first, then the record,
    /// then a persistence write. A filesystem failure leaves the record
    /// untouched. Fails with `NotFound` when no completed record matches.
    pub async fn remove(&self, identifier: &str) -> Result<(), DownloadError> {
        let mut state = self.state.lock().await;

        let index = state
            .completed
            .iter()
            .position(|r| r.identifier == identifier)
            .ok_or_else(|| DownloadError::NotFound(identifier.to_string()))?;

        // The base directory may have moved since completion; derive the
        // current path instead of trusting the stored one.
        let path = self.destination_for(identifier);
        tokio::fs::remove_file(&path).await?;

        state.completed.remove(index);
        let snapshot = state.completed.clone();
        drop(state);

        info!("Removed download {identifier}");
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Look up a record in the completed table only. In-progress and
    /// unknown identifiers both yield `None`.
    pub async fn get_completed(&self, identifier: &str) -> Option<DownloadRecord> {
        self.state
            .lock()
            .await
            .completed
            .iter()
            .find(|r| r.identifier == identifier)
            .cloned()
    }

    /// Suspend every live transfer. Intended for process-terminating
    /// teardown: suspension, not cancellation, keeps in-flight bytes
    /// resumable by a later run.
    pub async fn suspend_all(&self) {
        let state = self.state.lock().await;
        for (identifier, handle) in &state.handles {
            debug!("Suspending transfer for {identifier}");
            handle.suspend();
        }
    }

    /// Canonical destination for an identifier. The base directory is
    /// re-resolved on every call; the platform may relocate it between
    /// runs, so absolute paths must never be cached.
    pub fn destination_for(&self, identifier: &str) -> PathBuf {
        self.base_dir()
            .join(format!("{identifier}.{DOWNLOAD_EXTENSION}"))
    }

    fn base_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Apply one engine event. The event pump calls this for every event
    /// in arrival order; custom engines and tests may call it directly.
    pub async fn handle_event(&self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                identifier,
                bytes_written,
                bytes_expected,
            } => self.on_progress(&identifier, bytes_written, bytes_expected).await,
            TransferEvent::Finished {
                identifier,
                temp_path,
            } => self.on_finished(&identifier, temp_path).await,
            TransferEvent::Failed { identifier, cause } => {
                self.on_failed(&identifier, cause).await
            }
        }
    }

    async fn on_progress(
        &self,
        identifier: &str,
        bytes_written: u64,
        bytes_expected: Option<u64>,
    ) {
        // No percentage to report until the engine knows the total size.
        let Some(expected) = bytes_expected.filter(|e| *e > 0) else {
            return;
        };
        let percent = ((bytes_written.min(expected) * 100) / expected) as u8;

        let mut state = self.state.lock().await;
        let Some(record) = state
            .in_progress
            .iter_mut()
            .find(|r| r.identifier == identifier)
        else {
            // Late event for a download that already finished or failed.
            return;
        };
        record.progress = percent;
        drop(state);

        self.notify(DownloadEvent::Progress {
            identifier: identifier.to_string(),
            percent,
        });
    }

    async fn on_finished(&self, identifier: &str, temp_path: PathBuf) {
        let mut state = self.state.lock().await;

        state.handles.remove(identifier);
        let Some(index) = state
            .in_progress
            .iter()
            .position(|r| r.identifier == identifier)
        else {
            debug!("Finished event for unknown download {identifier}");
            return;
        };
        let mut record = state.in_progress.remove(index);

        let destination = self.destination_for(identifier);
        match move_into_place(&temp_path, &destination).await {
            Ok(()) => {
                record.status = DownloadStatus::Downloaded;
                record.progress = 100;
                record.local_path = Some(destination);
                // A re-download replaces any previous completed entry.
                state.completed.retain(|r| r.identifier != identifier);
                state.completed.push(record);
                let snapshot = state.completed.clone();
                drop(state);

                info!("Download {identifier} completed");
                self.persist(&snapshot).await;
                self.notify(DownloadEvent::StatusChanged {
                    identifier: identifier.to_string(),
                    progress: 100,
                    status: DownloadStatus::Downloaded,
                    error: None,
                });
            }
            Err(e) => {
                drop(state);
                let _ = tokio::fs::remove_file(&temp_path).await;

                warn!("Failed to store completed download {identifier}: {e}");
                self.notify(DownloadEvent::StatusChanged {
                    identifier: identifier.to_string(),
                    progress: 0,
                    status: DownloadStatus::None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    async fn on_failed(&self, identifier: &str, cause: String) {
        let mut state = self.state.lock().await;
        state.handles.remove(identifier);
        state.in_progress.retain(|r| r.identifier != identifier);
        drop(state);

        warn!("Download {identifier} failed: {cause}");
        self.notify(DownloadEvent::StatusChanged {
            identifier: identifier.to_string(),
            progress: 0,
            status: DownloadStatus::None,
            error: Some(cause),
        });
    }

    /// Best-effort persistence write; failures are logged, never surfaced.
    async fn persist(&self, completed: &[DownloadRecord]) {
        if let Err(e) = self.store.save(completed).await {
            warn!("Failed to persist completed downloads: {e}");
        }
    }

    fn notify(&self, event: DownloadEvent) {
        if let Some(tx) = self.observer.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Move a finished payload to its destination. Any leftover file there is
/// replaced (absence is not an error). Rename first, with a copy-and-delete
/// fallback for temp dirs on a different filesystem than the destination.
async fn move_into_place(temp_path: &Path, destination: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::remove_file(destination).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if tokio::fs::rename(temp_path, destination).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(temp_path, destination).await?;
    let _ = tokio::fs::remove_file(temp_path).await;

    Ok(())
}
