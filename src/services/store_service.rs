//! StoreService: the object store seen by the HTTP layer.
//!
//! Folder and object operations live here; the write path, the read path and
//! listings are in `encoder`, `decoder` and `catalog`, each adding its own
//! `impl StoreService` block.

use super::{
    chunker::MAX_PART_SIZE,
    layout::LayoutError,
    locks::ObjectLocks,
    preview::{InlineImagePreview, PreviewSource},
    progress::ProgressHub,
};
use crate::models::folder::Folder;
use crate::transport::{Transport, TransportError};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0} is being written, try again later")]
    Busy(String),
    #[error("{0}")]
    Aborted(String),
    #[error("object `{object_id}` partially written ({written} of {total} parts): {source}")]
    PartialWrite {
        object_id: String,
        written: usize,
        total: usize,
        #[source]
        source: TransportError,
    },
    #[error("object `{object_id}` could not be reconstructed: {reason}")]
    Reconstruction { object_id: String, reason: String },
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for StoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(what) => StoreError::NotFound(what),
            other => StoreError::Transport(other),
        }
    }
}

impl StoreError {
    pub(crate) fn layout(object_id: &str, err: LayoutError) -> Self {
        StoreError::Reconstruction {
            object_id: object_id.to_string(),
            reason: err.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Tunables of the store.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Largest part written, in bytes.
    pub part_size: usize,
    /// Pause after this many part writes, when the transport cannot report
    /// rate limits itself.
    pub pacing_every: usize,
    pub pacing_pause: Duration,
    pub rename_timeout: Duration,
    /// Objects read concurrently while listing.
    pub list_concurrency: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            part_size: MAX_PART_SIZE,
            pacing_every: 5,
            pacing_pause: Duration::from_secs(1),
            rename_timeout: Duration::from_secs(10),
            list_concurrency: 8,
        }
    }
}

/// StoreService keeps objects in chat threads:
/// - a folder is a channel of the configured collection
/// - an object is a thread of that channel
/// - the object's bytes are attachments of the thread's records
///
/// Cloning is cheap; all state is shared.
#[derive(Clone)]
pub struct StoreService {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) progress: Arc<ProgressHub>,
    pub(crate) locks: Arc<ObjectLocks>,
    pub(crate) preview: Arc<dyn PreviewSource>,
    pub(crate) settings: StoreSettings,
}

impl StoreService {
    pub fn new(transport: Arc<dyn Transport>, settings: StoreSettings) -> Self {
        Self {
            transport,
            progress: Arc::new(ProgressHub::new()),
            locks: Arc::new(ObjectLocks::new()),
            preview: Arc::new(InlineImagePreview::default()),
            settings,
        }
    }

    pub fn with_preview_source(mut self, preview: Arc<dyn PreviewSource>) -> Self {
        self.preview = preview;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn progress(&self) -> &Arc<ProgressHub> {
        &self.progress
    }

    pub async fn create_folder(&self, name: &str) -> StoreResult<Folder> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("folder name must not be empty".into()));
        }
        let channel = self.transport.create_channel(name).await?;
        info!(folder_id = %channel.id, name = %channel.name, "created folder");
        Ok(Folder {
            id: channel.id,
            name: channel.name,
        })
    }

    /// Delete a folder and, with it, every object inside.
    pub async fn delete_folder(&self, folder_id: &str) -> StoreResult<()> {
        if self.locks.is_container_busy(folder_id) {
            return Err(StoreError::Busy(format!("folder `{folder_id}`")));
        }
        self.transport.delete_channel(folder_id).await?;
        info!(folder_id, "deleted folder");
        Ok(())
    }

    /// Rename a folder, giving up after the configured deadline.
    ///
    /// An `Aborted` result does not mean the rename failed: the request may
    /// still be processed by the platform.
    pub async fn rename_folder(&self, folder_id: &str, new_name: &str) -> StoreResult<Folder> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(StoreError::Validation("newName must not be empty".into()));
        }
        let timeout = self.settings.rename_timeout;
        let channel = with_deadline(
            timeout,
            format!(
                "rename aborted after {}s; the change may still be processing",
                timeout.as_secs()
            ),
            self.transport.rename_channel(folder_id, new_name),
        )
        .await?;
        info!(folder_id, name = %channel.name, "renamed folder");
        Ok(Folder {
            id: channel.id,
            name: channel.name,
        })
    }

    pub async fn delete_object(&self, folder_id: &str, object_id: &str) -> StoreResult<()> {
        if self.locks.is_locked(folder_id, object_id) {
            return Err(StoreError::Busy(format!("object `{object_id}`")));
        }
        self.transport.delete_thread(folder_id, object_id).await?;
        debug!(folder_id, object_id, "deleted object");
        Ok(())
    }
}

/// Await `fut`, or fail with `Aborted(message)` once `timeout` elapses.
async fn with_deadline<T, F>(timeout: Duration, message: String, fut: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Aborted(message)),
    }
}
