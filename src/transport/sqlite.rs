//! SQLite-backed transport.
//!
//! Mirrors the chat platform's channel/thread/message model in four tables so
//! the service can run without network access. Attachment bytes live in the
//! `attachments.data` BLOB column and are handed back in fixed-size slices.

use super::{
    Attachment, AttachmentBody, ChannelInfo, Record, ThreadInfo, Transport, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Slice size used when streaming attachment bytes back out.
const READ_SLICE: usize = 64 * 1024;

#[derive(FromRow)]
struct ChannelRow {
    id: String,
    name: String,
}

#[derive(FromRow)]
struct ThreadRow {
    id: String,
    channel_id: String,
    name: String,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct RecordRow {
    seq: i64,
    id: String,
    content: String,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct AttachmentRow {
    id: String,
    record_id: String,
    filename: String,
    content_type: Option<String>,
    size_bytes: i64,
}

impl From<ChannelRow> for ChannelInfo {
    fn from(row: ChannelRow) -> Self {
        ChannelInfo {
            id: row.id,
            name: row.name,
        }
    }
}

impl From<ThreadRow> for ThreadInfo {
    fn from(row: ThreadRow) -> Self {
        ThreadInfo {
            id: row.id,
            channel_id: row.channel_id,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

impl From<AttachmentRow> for Attachment {
    fn from(row: AttachmentRow) -> Self {
        Attachment {
            id: row.id,
            filename: row.filename,
            size: row.size_bytes.max(0) as u64,
            content_type: row.content_type,
            url: None,
        }
    }
}

#[derive(Clone)]
pub struct SqliteTransport {
    db: Arc<SqlitePool>,
}

impl SqliteTransport {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let transport = Self::new(Arc::new(pool));
        transport.migrate().await?;
        Ok(transport)
    }

    /// A private in-memory database, gone once the transport is dropped.
    pub async fn in_memory() -> TransportResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Every connection to `:memory:` is its own database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let transport = Self::new(Arc::new(pool));
        transport.migrate().await?;
        Ok(transport)
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> TransportResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    async fn ensure_thread(&self, thread_id: &str) -> TransportResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1 FROM threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(&*self.db)
            .await?
            .map(|_| ())
            .ok_or_else(|| TransportError::NotFound(format!("thread {thread_id}")))
    }

    /// Attach attachment rows to their records, keeping record order.
    fn assemble(records: Vec<RecordRow>, attachments: Vec<AttachmentRow>) -> Vec<Record> {
        let mut by_record: HashMap<String, Vec<Attachment>> = HashMap::new();
        for row in attachments {
            by_record
                .entry(row.record_id.clone())
                .or_default()
                .push(row.into());
        }

        records
            .into_iter()
            .map(|row| Record {
                attachments: by_record.remove(&row.id).unwrap_or_default(),
                order_key: row.seq.max(0) as u64,
                id: row.id,
                content: row.content,
                created_at: row.created_at,
            })
            .collect()
    }

    async fn insert_record(
        &self,
        thread_id: &str,
        content: &str,
        attachment: Option<(&str, Option<&str>, Bytes)>,
    ) -> TransportResult<Record> {
        self.ensure_thread(thread_id).await?;

        let mut tx = self.db.begin().await?;
        let record_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let seq = sqlx::query_scalar::<_, i64>(
            "INSERT INTO records (id, thread_id, content, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING seq",
        )
        .bind(&record_id)
        .bind(thread_id)
        .bind(content)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;

        let mut attachments = Vec::new();
        if let Some((filename, content_type, data)) = attachment {
            let attachment = Attachment {
                id: Uuid::new_v4().to_string(),
                filename: filename.to_string(),
                size: data.len() as u64,
                content_type: content_type.map(str::to_string),
                url: None,
            };
            sqlx::query(
                "INSERT INTO attachments (id, record_id, filename, content_type, size_bytes, data)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&attachment.id)
            .bind(&record_id)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(attachment.size as i64)
            .bind(data.as_ref())
            .execute(&mut *tx)
            .await?;
            attachments.push(attachment);
        }
        tx.commit().await?;

        Ok(Record {
            id: record_id,
            order_key: seq.max(0) as u64,
            content: content.to_string(),
            attachments,
            created_at,
        })
    }
}

#[async_trait]
impl Transport for SqliteTransport {
    async fn health_check(&self) -> TransportResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one == 1 {
            Ok(())
        } else {
            Err(TransportError::Decode(format!("unexpected probe result {one}")))
        }
    }

    async fn list_channels(&self) -> TransportResult<Vec<ChannelInfo>> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, name FROM channels ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_channel(&self, channel_id: &str) -> TransportResult<ChannelInfo> {
        sqlx::query_as::<_, ChannelRow>("SELECT id, name FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(&*self.db)
            .await?
            .map(Into::into)
            .ok_or_else(|| TransportError::NotFound(format!("channel {channel_id}")))
    }

    async fn create_channel(&self, name: &str) -> TransportResult<ChannelInfo> {
        let channel = ChannelInfo {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        sqlx::query("INSERT INTO channels (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&channel.id)
            .bind(&channel.name)
            .bind(Utc::now())
            .execute(&*self.db)
            .await?;
        Ok(channel)
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> TransportResult<ChannelInfo> {
        sqlx::query_as::<_, ChannelRow>(
            "UPDATE channels SET name = ? WHERE id = ? RETURNING id, name",
        )
        .bind(name)
        .bind(channel_id)
        .fetch_optional(&*self.db)
        .await?
        .map(Into::into)
        .ok_or_else(|| TransportError::NotFound(format!("channel {channel_id}")))
    }

    async fn delete_channel(&self, channel_id: &str) -> TransportResult<()> {
        // Threads, records and attachments follow through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TransportError::NotFound(format!("channel {channel_id}")));
        }
        Ok(())
    }

    async fn list_threads(&self, channel_id: &str) -> TransportResult<Vec<ThreadInfo>> {
        self.get_channel(channel_id).await?;
        let rows = sqlx::query_as::<_, ThreadRow>(
            "SELECT id, channel_id, name, created_at FROM threads
             WHERE channel_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(channel_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_thread(&self, channel_id: &str, thread_id: &str) -> TransportResult<ThreadInfo> {
        sqlx::query_as::<_, ThreadRow>(
            "SELECT id, channel_id, name, created_at FROM threads WHERE id = ? AND channel_id = ?",
        )
        .bind(thread_id)
        .bind(channel_id)
        .fetch_optional(&*self.db)
        .await?
        .map(Into::into)
        .ok_or_else(|| TransportError::NotFound(format!("thread {thread_id}")))
    }

    async fn create_thread(&self, channel_id: &str, name: &str) -> TransportResult<ThreadInfo> {
        self.get_channel(channel_id).await?;
        let thread = ThreadInfo {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO threads (id, channel_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(&thread.id)
            .bind(&thread.channel_id)
            .bind(&thread.name)
            .bind(thread.created_at)
            .execute(&*self.db)
            .await?;
        Ok(thread)
    }

    async fn delete_thread(&self, channel_id: &str, thread_id: &str) -> TransportResult<()> {
        let result = sqlx::query("DELETE FROM threads WHERE id = ? AND channel_id = ?")
            .bind(thread_id)
            .bind(channel_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TransportError::NotFound(format!("thread {thread_id}")));
        }
        Ok(())
    }

    async fn send_text(&self, thread_id: &str, content: &str) -> TransportResult<Record> {
        self.insert_record(thread_id, content, None).await
    }

    async fn send_attachment(
        &self,
        thread_id: &str,
        content: Option<&str>,
        filename: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> TransportResult<Record> {
        self.insert_record(
            thread_id,
            content.unwrap_or_default(),
            Some((filename, content_type, data)),
        )
        .await
    }

    async fn fetch_records(&self, thread_id: &str) -> TransportResult<Vec<Record>> {
        self.ensure_thread(thread_id).await?;
        let records = sqlx::query_as::<_, RecordRow>(
            "SELECT seq, id, content, created_at FROM records WHERE thread_id = ? ORDER BY seq ASC",
        )
        .bind(thread_id)
        .fetch_all(&*self.db)
        .await?;
        let attachments = sqlx::query_as::<_, AttachmentRow>(
            "SELECT a.id, a.record_id, a.filename, a.content_type, a.size_bytes
             FROM attachments a JOIN records r ON a.record_id = r.id
             WHERE r.thread_id = ? ORDER BY a.rowid ASC",
        )
        .bind(thread_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(Self::assemble(records, attachments))
    }

    async fn fetch_head_records(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> TransportResult<Vec<Record>> {
        self.ensure_thread(thread_id).await?;
        let records = sqlx::query_as::<_, RecordRow>(
            "SELECT seq, id, content, created_at FROM records
             WHERE thread_id = ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(thread_id)
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        let attachments = sqlx::query_as::<_, AttachmentRow>(
            "SELECT id, record_id, filename, content_type, size_bytes FROM attachments
             WHERE record_id IN (
                 SELECT id FROM records WHERE thread_id = ? ORDER BY seq ASC LIMIT ?
             )
             ORDER BY rowid ASC",
        )
        .bind(thread_id)
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(Self::assemble(records, attachments))
    }

    async fn open_attachment(&self, attachment: &Attachment) -> TransportResult<AttachmentBody> {
        let data = sqlx::query_scalar::<_, Vec<u8>>("SELECT data FROM attachments WHERE id = ?")
            .bind(&attachment.id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| TransportError::NotFound(format!("attachment {}", attachment.id)))?;

        let data = Bytes::from(data);
        let len = data.len();
        let slices = (0..len)
            .step_by(READ_SLICE)
            .map(|start| Ok(data.slice(start..(start + READ_SLICE).min(len))))
            .collect::<Vec<TransportResult<Bytes>>>();

        Ok(AttachmentBody {
            content_type: attachment.content_type.clone(),
            content_length: Some(len as u64),
            stream: futures::stream::iter(slices).boxed(),
        })
    }

    fn handles_rate_limits(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn transport() -> SqliteTransport {
        SqliteTransport::in_memory().await.expect("in-memory sqlite")
    }

    async fn read_all(body: AttachmentBody) -> Vec<u8> {
        let mut out = Vec::new();
        let mut stream = body.stream;
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn records_keep_creation_order_with_attachments() {
        let t = transport().await;
        let channel = t.create_channel("docs").await.unwrap();
        let thread = t.create_thread(&channel.id, "report.pdf").await.unwrap();

        t.send_text(&thread.id, "report.pdf").await.unwrap();
        t.send_text(&thread.id, "3 bytes").await.unwrap();
        t.send_attachment(&thread.id, None, "report.pdf", None, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let records = t.fetch_records(&thread.id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.windows(2).all(|w| w[0].order_key < w[1].order_key));
        assert_eq!(records[0].content, "report.pdf");
        assert_eq!(records[2].attachments.len(), 1);
        assert_eq!(records[2].attachments[0].size, 3);

        let head = t.fetch_head_records(&thread.id, 2).await.unwrap();
        assert_eq!(head.len(), 2);
        assert!(head.iter().all(|r| r.attachments.is_empty()));
    }

    #[tokio::test]
    async fn attachment_bytes_stream_back_in_slices() {
        let t = transport().await;
        let channel = t.create_channel("media").await.unwrap();
        let thread = t.create_thread(&channel.id, "blob").await.unwrap();
        let payload: Vec<u8> = (0..(READ_SLICE * 2 + 10)).map(|i| (i % 251) as u8).collect();

        let record = t
            .send_attachment(&thread.id, None, "blob", None, Bytes::from(payload.clone()))
            .await
            .unwrap();
        let body = t.open_attachment(&record.attachments[0]).await.unwrap();

        assert_eq!(body.content_length, Some(payload.len() as u64));
        assert_eq!(read_all(body).await, payload);
    }

    #[tokio::test]
    async fn deleting_a_channel_cascades_to_its_threads() {
        let t = transport().await;
        let channel = t.create_channel("old").await.unwrap();
        let a = t.create_thread(&channel.id, "a").await.unwrap();
        let b = t.create_thread(&channel.id, "b").await.unwrap();
        t.send_attachment(&a.id, None, "a", None, Bytes::from_static(b"x"))
            .await
            .unwrap();

        t.delete_channel(&channel.id).await.unwrap();

        assert!(t.get_thread(&channel.id, &a.id).await.unwrap_err().is_not_found());
        assert!(t.fetch_records(&b.id).await.unwrap_err().is_not_found());
        let orphans = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM attachments")
            .fetch_one(t.pool())
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn thread_lookup_is_scoped_to_its_channel() {
        let t = transport().await;
        let one = t.create_channel("one").await.unwrap();
        let two = t.create_channel("two").await.unwrap();
        let thread = t.create_thread(&one.id, "file").await.unwrap();

        assert!(t.get_thread(&two.id, &thread.id).await.unwrap_err().is_not_found());
        assert!(t.delete_thread(&two.id, &thread.id).await.unwrap_err().is_not_found());
        assert_eq!(t.get_thread(&one.id, &thread.id).await.unwrap().name, "file");
    }

    #[tokio::test]
    async fn missing_entities_report_not_found() {
        let t = transport().await;
        assert!(t.get_channel("nope").await.unwrap_err().is_not_found());
        assert!(t.rename_channel("nope", "x").await.unwrap_err().is_not_found());
        assert!(t.delete_channel("nope").await.unwrap_err().is_not_found());
        assert!(t.send_text("nope", "hi").await.unwrap_err().is_not_found());
        assert!(t.create_thread("nope", "f").await.unwrap_err().is_not_found());
    }
}
