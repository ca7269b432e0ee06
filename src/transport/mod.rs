//! The chat platform seen as a byte-storage medium.
//!
//! Channels act as containers, threads as objects and messages (with their
//! attachments) as the records an object is made of. Everything above this
//! module talks to a `dyn Transport` and never to a concrete backend.

pub mod discord;
pub mod retry;
pub mod sqlite;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use std::time::Duration;
use thiserror::Error;

pub use discord::DiscordTransport;
pub use sqlite::SqliteTransport;

/// A top-level channel, i.e. a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

/// A thread under a channel, i.e. one stored object.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: String,
    pub channel_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A file hosted by the platform and attached to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub content_type: Option<String>,
    /// Publicly reachable URL, when the backend hosts one.
    pub url: Option<String>,
}

/// One message inside a thread.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    /// Monotonic creation key; sorting by it yields creation order.
    pub order_key: u64,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// Bytes of an attachment, delivered incrementally.
pub struct AttachmentBody {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, TransportResult<Bytes>>,
}

impl std::fmt::Debug for AttachmentBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("transport call timed out")]
    Timeout,
    #[error("platform returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }

    /// Errors worth another attempt: rate limits, timeouts and server faults.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::RateLimited { .. } | TransportError::Timeout => true,
            TransportError::Api { status, .. } => *status >= 500,
            TransportError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    /// Errors after which the platform provably never processed the request,
    /// so even a non-idempotent call can be sent again.
    pub fn is_safe_to_resend(&self) -> bool {
        match self {
            TransportError::RateLimited { .. } => true,
            TransportError::Http(err) => err.is_connect() && !err.is_timeout(),
            _ => false,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Storage primitives offered by the chat platform.
///
/// Implementations must be cheap to share (`Arc<dyn Transport>`); one
/// instance is built at startup and handed to every component.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Cheap reachability probe.
    async fn health_check(&self) -> TransportResult<()>;

    async fn list_channels(&self) -> TransportResult<Vec<ChannelInfo>>;

    async fn get_channel(&self, channel_id: &str) -> TransportResult<ChannelInfo>;

    /// Create a channel under the configured collection.
    ///
    /// Returns `NotFound` when the collection itself is missing.
    async fn create_channel(&self, name: &str) -> TransportResult<ChannelInfo>;

    async fn rename_channel(&self, channel_id: &str, name: &str) -> TransportResult<ChannelInfo>;

    /// Delete a channel. Every thread beneath it goes with it.
    async fn delete_channel(&self, channel_id: &str) -> TransportResult<()>;

    /// Active and archived threads of a channel.
    async fn list_threads(&self, channel_id: &str) -> TransportResult<Vec<ThreadInfo>>;

    /// `NotFound` when the thread is absent or belongs to another channel.
    async fn get_thread(&self, channel_id: &str, thread_id: &str) -> TransportResult<ThreadInfo>;

    async fn create_thread(&self, channel_id: &str, name: &str) -> TransportResult<ThreadInfo>;

    async fn delete_thread(&self, channel_id: &str, thread_id: &str) -> TransportResult<()>;

    async fn send_text(&self, thread_id: &str, content: &str) -> TransportResult<Record>;

    async fn send_attachment(
        &self,
        thread_id: &str,
        content: Option<&str>,
        filename: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> TransportResult<Record>;

    /// Every record of a thread, in no particular order.
    async fn fetch_records(&self, thread_id: &str) -> TransportResult<Vec<Record>>;

    /// The `limit` oldest records of a thread, in no particular order.
    async fn fetch_head_records(&self, thread_id: &str, limit: usize)
    -> TransportResult<Vec<Record>>;

    async fn open_attachment(&self, attachment: &Attachment) -> TransportResult<AttachmentBody>;

    /// Whether the backend reacts to the platform's own rate-limit signal.
    fn handles_rate_limits(&self) -> bool;
}

/// Bound the wait for each chunk of `stream`; a stalled read ends the stream
/// with `TransportError::Timeout`.
pub fn with_idle_timeout(
    stream: BoxStream<'static, TransportResult<Bytes>>,
    idle: Duration,
) -> BoxStream<'static, TransportResult<Bytes>> {
    futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((Err(TransportError::Timeout), None)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_timeout_ends_stalled_stream() {
        let stalled = futures::stream::once(async { Ok(Bytes::from_static(b"first")) })
            .chain(futures::stream::pending())
            .boxed();
        let mut guarded = with_idle_timeout(stalled, Duration::from_millis(20));

        assert_eq!(guarded.next().await.unwrap().unwrap(), Bytes::from_static(b"first"));
        assert!(matches!(guarded.next().await, Some(Err(TransportError::Timeout))));
        assert!(guarded.next().await.is_none());
    }

    #[test]
    fn transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(
            TransportError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(
            TransportError::Api {
                status: 502,
                message: "bad gateway".into()
            }
            .is_transient()
        );
        assert!(
            !TransportError::Api {
                status: 403,
                message: "missing access".into()
            }
            .is_transient()
        );
        assert!(!TransportError::NotFound("thread".into()).is_transient());
    }

    #[test]
    fn only_unprocessed_requests_are_safe_to_resend() {
        assert!(
            TransportError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .is_safe_to_resend()
        );
        assert!(!TransportError::Timeout.is_safe_to_resend());
        assert!(
            !TransportError::Api {
                status: 502,
                message: "bad gateway".into()
            }
            .is_safe_to_resend()
        );
    }
}
