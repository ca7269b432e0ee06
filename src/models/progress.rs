//! Progress events pushed to websocket observers.

use serde::Serialize;

/// Which side of the store an event belongs to.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
}

/// One progress notification, tagged with the object it concerns.
///
/// Serialized with a `type` discriminator, e.g.
/// `{"type":"uploadProgress","fileID":"..","chunkIndex":2,"totalChunks":3}`.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    /// Byte-level percentage of a single-part download.
    ProgressWithinLimit {
        #[serde(rename = "fileID")]
        file_id: String,
        progress: u8,
    },
    /// Parts fetched so far by a multi-part download. `progress` is scaled
    /// into the fetch phase's share of the whole transfer.
    ProgressOutsideLimit {
        #[serde(rename = "fileID")]
        file_id: String,
        buffer_index: usize,
        total_buffers: usize,
        progress: f64,
    },
    /// Parts written so far by an upload.
    UploadProgress {
        #[serde(rename = "fileID")]
        file_id: String,
        chunk_index: usize,
        total_chunks: usize,
    },
    Completed {
        #[serde(rename = "fileID")]
        file_id: String,
        operation: Operation,
    },
    Failed {
        #[serde(rename = "fileID")]
        file_id: String,
        operation: Operation,
        error: String,
    },
    /// The operation was dropped before finishing, e.g. the client went away.
    Cancelled {
        #[serde(rename = "fileID")]
        file_id: String,
        operation: Operation,
    },
}

impl ProgressEvent {
    pub fn file_id(&self) -> &str {
        match self {
            ProgressEvent::ProgressWithinLimit { file_id, .. }
            | ProgressEvent::ProgressOutsideLimit { file_id, .. }
            | ProgressEvent::UploadProgress { file_id, .. }
            | ProgressEvent::Completed { file_id, .. }
            | ProgressEvent::Failed { file_id, .. }
            | ProgressEvent::Cancelled { file_id, .. } => file_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. }
                | ProgressEvent::Failed { .. }
                | ProgressEvent::Cancelled { .. }
        )
    }
}
