//! Read path: reassembling an object from its thread.
//!
//! Single-part objects are streamed straight from the transport. Multi-part
//! objects are fetched part by part, concatenated and checked against the
//! stored digest before anything is handed out.

use super::{
    layout::{HEAD_RECORDS, ObjectHead, ObjectLayout},
    progress::OperationReporter,
    store_service::{StoreError, StoreResult, StoreService},
};
use crate::models::progress::{Operation, ProgressEvent};
use crate::transport::{Attachment, AttachmentBody, TransportError, TransportResult};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream::BoxStream};
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, info};

const OCTET_STREAM: &str = "application/octet-stream";

/// Share of the overall progress bar the part fetch phase reports into.
/// The client fills the rest while receiving the buffered body.
const FETCH_PHASE_SHARE: f64 = 50.0;

/// A retrieved object, ready to be sent.
pub struct Retrieved {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub etag: Option<String>,
    pub body: RetrievedBody,
}

pub enum RetrievedBody {
    /// Bytes arrive as the transport delivers them.
    Streamed {
        stream: ProgressStream,
        content_length: u64,
    },
    /// The whole object, already reassembled.
    Buffered(Bytes),
}

impl RetrievedBody {
    pub fn is_streamed(&self) -> bool {
        matches!(self, RetrievedBody::Streamed { .. })
    }
}

/// A preview image, ready to be sent.
pub struct RetrievedPreview {
    pub filename: String,
    pub content_type: String,
    pub body: AttachmentBody,
}

/// Byte stream of a single-part download that publishes its progress.
///
/// The percentage is measured against the declared size and only published
/// when it grows. The operation completes as soon as the declared size has
/// been delivered, since a client reading by `Content-Length` stops polling
/// there. A stream ending short fails it, and dropping it earlier cancels it.
pub struct ProgressStream {
    inner: BoxStream<'static, TransportResult<Bytes>>,
    reporter: Option<OperationReporter>,
    declared: u64,
    received: u64,
    last_percent: Option<u8>,
    done: bool,
}

impl ProgressStream {
    fn new(
        inner: BoxStream<'static, TransportResult<Bytes>>,
        reporter: OperationReporter,
        declared: u64,
    ) -> Self {
        let mut stream = Self {
            inner,
            reporter: Some(reporter),
            declared,
            received: 0,
            last_percent: None,
            done: false,
        };
        // An empty body may never be polled at all.
        if declared == 0 {
            stream.finish();
        }
        stream
    }

    fn percent(&self) -> u8 {
        if self.declared == 0 {
            return 100;
        }
        (self.received.saturating_mul(100) / self.declared).min(100) as u8
    }

    fn report(&mut self, percent: u8) {
        if self.last_percent.is_some_and(|last| last >= percent) {
            return;
        }
        self.last_percent = Some(percent);
        if let Some(reporter) = &self.reporter {
            reporter.publish(ProgressEvent::ProgressWithinLimit {
                file_id: reporter.file_id().to_string(),
                progress: percent,
            });
        }
    }

    fn finish(&mut self) {
        self.report(100);
        if let Some(reporter) = self.reporter.take() {
            reporter.complete();
        }
    }
}

impl Stream for ProgressStream {
    type Item = TransportResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.received += chunk.len() as u64;
                if this.received >= this.declared {
                    this.finish();
                } else {
                    let percent = this.percent();
                    this.report(percent);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                if let Some(reporter) = this.reporter.take() {
                    reporter.fail(&err);
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                if this.received < this.declared {
                    let err = TransportError::Decode(format!(
                        "attachment ended after {} of {} bytes",
                        this.received, this.declared
                    ));
                    if let Some(reporter) = this.reporter.take() {
                        reporter.fail(&err);
                    }
                    return Poll::Ready(Some(Err(err)));
                }
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

fn guess_content_type(name: &str) -> Option<String> {
    mime_guess::from_path(name).first_raw().map(str::to_string)
}

impl StoreService {
    /// Fetch an object for download.
    pub async fn retrieve_object(&self, folder_id: &str, object_id: &str) -> StoreResult<Retrieved> {
        if self.locks.is_locked(folder_id, object_id) {
            return Err(StoreError::Busy(format!("object `{object_id}`")));
        }
        self.transport.get_thread(folder_id, object_id).await?;
        let records = self.transport.fetch_records(object_id).await?;
        let layout =
            ObjectLayout::parse(records).map_err(|err| StoreError::layout(object_id, err))?;
        let reporter =
            OperationReporter::new(self.progress.clone(), object_id, Operation::Download);

        let ObjectLayout { head, parts } = layout;
        let declared = head.size.size;

        if let [part] = parts.as_slice() {
            let body = match self.transport.open_attachment(part).await {
                Ok(body) => body,
                Err(err) => {
                    reporter.fail(&err);
                    return Err(StoreError::Reconstruction {
                        object_id: object_id.to_string(),
                        reason: err.to_string(),
                    });
                }
            };
            let content_type = part
                .content_type
                .clone()
                .or(body.content_type)
                .or_else(|| guess_content_type(&head.name))
                .unwrap_or_else(|| OCTET_STREAM.to_string());
            let content_length = body.content_length.unwrap_or(part.size);
            debug!(object_id, declared, content_length, "streaming single-part object");
            return Ok(Retrieved {
                id: object_id.to_string(),
                name: head.name,
                size: declared,
                content_type,
                etag: head.size.etag,
                body: RetrievedBody::Streamed {
                    stream: ProgressStream::new(body.stream, reporter, declared),
                    content_length,
                },
            });
        }

        let total = parts.len();
        let stored: u64 = parts.iter().map(|part| part.size).sum();
        if stored != declared {
            let reason = format!("parts hold {stored} bytes, size record declares {declared}");
            reporter.fail(&reason);
            return Err(StoreError::Reconstruction {
                object_id: object_id.to_string(),
                reason,
            });
        }
        let capacity = usize::try_from(stored).map_err(|_| StoreError::Reconstruction {
            object_id: object_id.to_string(),
            reason: format!("{stored} bytes do not fit in memory"),
        })?;
        let mut buffer = BytesMut::with_capacity(capacity);
        for (index, part) in parts.iter().enumerate() {
            if let Err(err) = self.fetch_part(part, &mut buffer).await {
                reporter.fail(&err);
                return Err(StoreError::Reconstruction {
                    object_id: object_id.to_string(),
                    reason: format!("part {} of {total}: {err}", index + 1),
                });
            }
            reporter.publish(ProgressEvent::ProgressOutsideLimit {
                file_id: object_id.to_string(),
                buffer_index: index + 1,
                total_buffers: total,
                progress: (index + 1) as f64 / total as f64 * FETCH_PHASE_SHARE,
            });
        }
        let buffer = buffer.freeze();

        if let Err(reason) = verify(&head, &buffer) {
            reporter.fail(&reason);
            return Err(StoreError::Reconstruction {
                object_id: object_id.to_string(),
                reason,
            });
        }
        reporter.complete();
        info!(object_id, size = buffer.len(), parts = total, "reassembled object");

        Ok(Retrieved {
            id: object_id.to_string(),
            content_type: guess_content_type(&head.name)
                .unwrap_or_else(|| OCTET_STREAM.to_string()),
            name: head.name,
            size: declared,
            etag: head.size.etag,
            body: RetrievedBody::Buffered(buffer),
        })
    }

    async fn fetch_part(
        &self,
        part: &Attachment,
        buffer: &mut BytesMut,
    ) -> TransportResult<()> {
        let mut body = self.transport.open_attachment(part).await?;
        while let Some(chunk) = body.stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(())
    }

    /// Fetch the preview image stored with an object.
    pub async fn retrieve_preview(
        &self,
        folder_id: &str,
        object_id: &str,
    ) -> StoreResult<RetrievedPreview> {
        self.transport.get_thread(folder_id, object_id).await?;
        let records = self
            .transport
            .fetch_head_records(object_id, HEAD_RECORDS)
            .await?;
        let head = ObjectHead::parse(records).map_err(|err| StoreError::layout(object_id, err))?;
        let preview = head
            .preview
            .ok_or_else(|| StoreError::NotFound(format!("preview of object `{object_id}`")))?;
        let body = self.transport.open_attachment(&preview).await?;
        let content_type = preview
            .content_type
            .clone()
            .or_else(|| body.content_type.clone())
            .or_else(|| guess_content_type(&preview.filename))
            .unwrap_or_else(|| OCTET_STREAM.to_string());
        Ok(RetrievedPreview {
            filename: preview.filename,
            content_type,
            body,
        })
    }
}

/// Check a reassembled buffer against its size record.
fn verify(head: &ObjectHead, buffer: &Bytes) -> Result<(), String> {
    if buffer.len() as u64 != head.size.size {
        return Err(format!(
            "reassembled {} bytes, expected {}",
            buffer.len(),
            head.size.size
        ));
    }
    if let Some(expected) = &head.size.etag {
        let actual = format!("{:x}", md5::compute(buffer));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(format!("md5 mismatch: stored {expected}, computed {actual}"));
        }
    }
    Ok(())
}
