//! Write path: turning an upload into a thread of records.

use super::{
    chunker,
    layout::{self, NO_PREVIEW_MARKER, PREVIEW_MARKER, SizeRecord},
    preview::preview_filename,
    progress::OperationReporter,
    store_service::{StoreError, StoreResult, StoreService},
};
use crate::models::progress::{Operation, ProgressEvent};
use crate::transport::TransportError;
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Longest display name accepted; it must fit in one text record.
pub const MAX_NAME_LEN: usize = 1024;

/// An object about to be stored.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
    /// Explicit preview. When absent the store's preview source decides.
    pub preview: Option<PreviewImage>,
}

#[derive(Debug, Clone)]
pub struct PreviewImage {
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// What was written for a successful upload.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub parts: usize,
    pub etag: String,
}

fn validate_name(name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("file name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(StoreError::Validation(format!(
            "file name longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

impl StoreService {
    /// Store `upload` as a new object of `folder_id`.
    ///
    /// Records are written strictly in order. A failure part-way leaves the
    /// thread behind, incomplete; it is reported as `PartialWrite` and can be
    /// removed with [`delete_object`](Self::delete_object).
    pub async fn store_object(&self, folder_id: &str, upload: Upload) -> StoreResult<StoredObject> {
        validate_name(&upload.name)?;
        self.transport.get_channel(folder_id).await?;

        let parts = chunker::plan_parts(&upload.data, self.settings.part_size);
        let etag = format!("{:x}", md5::compute(&upload.data));
        let size = SizeRecord::new(upload.data.len() as u64, parts.len() as u32, etag.clone());

        let thread = self
            .transport
            .create_thread(folder_id, &layout::thread_name(&upload.name))
            .await?;
        let object_id = thread.id;
        let _guard = self
            .locks
            .try_lock(folder_id, &object_id)
            .ok_or_else(|| StoreError::Busy(format!("object `{object_id}`")))?;

        let reporter =
            OperationReporter::new(self.progress.clone(), object_id.clone(), Operation::Upload);
        let mut written = 0;
        match self
            .write_records(&upload, &size, &parts, &reporter, &mut written)
            .await
        {
            Ok(()) => {
                reporter.complete();
                info!(
                    folder_id,
                    object_id = %object_id,
                    size = size.size,
                    parts = parts.len(),
                    "stored object"
                );
                Ok(StoredObject {
                    id: object_id,
                    name: upload.name,
                    size: size.size,
                    parts: parts.len(),
                    etag,
                })
            }
            Err(source) => {
                warn!(
                    folder_id,
                    object_id = %object_id,
                    written,
                    total = parts.len(),
                    error = %source,
                    "upload aborted, thread left incomplete"
                );
                reporter.fail(&source);
                Err(StoreError::PartialWrite {
                    object_id,
                    written,
                    total: parts.len(),
                    source,
                })
            }
        }
    }

    async fn write_records(
        &self,
        upload: &Upload,
        size: &SizeRecord,
        parts: &[Bytes],
        reporter: &OperationReporter,
        written: &mut usize,
    ) -> Result<(), TransportError> {
        let thread_id = reporter.file_id();
        self.transport.send_text(thread_id, &upload.name).await?;
        self.transport.send_text(thread_id, &size.to_string()).await?;

        let preview = upload.preview.clone().or_else(|| {
            self.preview
                .preview_for(upload.content_type.as_deref(), &upload.data)
                .map(|data| PreviewImage {
                    content_type: upload.content_type.clone(),
                    data,
                })
        });
        match preview {
            Some(image) => {
                self.transport
                    .send_attachment(
                        thread_id,
                        Some(PREVIEW_MARKER),
                        &preview_filename(image.content_type.as_deref()),
                        image.content_type.as_deref(),
                        image.data,
                    )
                    .await?;
            }
            None => {
                self.transport.send_text(thread_id, NO_PREVIEW_MARKER).await?;
            }
        }

        let total = parts.len();
        let pace = !self.transport.handles_rate_limits() && self.settings.pacing_every > 0;
        for (index, part) in parts.iter().enumerate() {
            let content_type = if total == 1 {
                upload.content_type.as_deref()
            } else {
                Some("text/plain")
            };
            self.transport
                .send_attachment(
                    thread_id,
                    None,
                    &layout::part_name(&upload.name, index, total),
                    content_type,
                    part.clone(),
                )
                .await?;
            *written = index + 1;
            reporter.publish(ProgressEvent::UploadProgress {
                file_id: thread_id.to_string(),
                chunk_index: index + 1,
                total_chunks: total,
            });

            if pace && *written % self.settings.pacing_every == 0 && *written < total {
                debug!(thread_id, written = *written, "pausing between part writes");
                tokio::time::sleep(self.settings.pacing_pause).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert!(validate_name("report.pdf").is_ok());
        assert!(matches!(validate_name("  "), Err(StoreError::Validation(_))));
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(matches!(
            validate_name(&"x".repeat(MAX_NAME_LEN + 1)),
            Err(StoreError::Validation(_))
        ));
    }
}
