//! Discord REST (v10) transport.
//!
//! The configured guild is the collection, text channels are containers and
//! public threads are objects. Attachments are fetched from the CDN URL the
//! API hands back.

use super::{
    Attachment, AttachmentBody, ChannelInfo, Record, ThreadInfo, Transport, TransportError,
    TransportResult,
    retry::{RetryConfig, retry_transport, retry_unprocessed},
    with_idle_timeout,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{
    Client, Method, RequestBuilder, Response, StatusCode, header,
    multipart::{Form, Part},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::{collections::HashSet, time::Duration};
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

const GUILD_TEXT: u8 = 0;
const PUBLIC_THREAD: u8 = 11;
const THREAD_TYPES: [u8; 3] = [10, 11, 12];
/// Auto-archive after an hour, as the threads are never chatted in.
const AUTO_ARCHIVE_MINUTES: u32 = 60;
const PAGE_SIZE: usize = 100;
/// 2015-01-01T00:00:00Z, the snowflake epoch.
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub token: String,
    pub guild_id: String,
    pub api_base: String,
    /// Bound for every metadata call.
    pub request_timeout: Duration,
    /// Bound for a single attachment upload.
    pub upload_timeout: Duration,
    /// Longest wait for the next chunk of an attachment download.
    pub idle_timeout: Duration,
    pub retry: RetryConfig,
}

impl DiscordConfig {
    pub fn new(token: impl Into<String>, guild_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            guild_id: guild_id.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    thread_metadata: Option<ApiThreadMetadata>,
}

#[derive(Debug, Deserialize)]
struct ApiThreadMetadata {
    archive_timestamp: String,
}

#[derive(Debug, Deserialize)]
struct ApiThreadList {
    threads: Vec<ApiChannel>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<ApiAttachment>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ApiAttachment {
    id: String,
    filename: String,
    size: u64,
    url: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRateLimit {
    retry_after: f64,
}

/// Creation time encoded in a snowflake id.
fn snowflake_time(id: &str) -> DateTime<Utc> {
    id.parse::<u64>()
        .ok()
        .and_then(|raw| DateTime::from_timestamp_millis(((raw >> 22) + DISCORD_EPOCH_MS) as i64))
        .unwrap_or_default()
}

fn snowflake_key(id: &str) -> u64 {
    id.parse().unwrap_or_default()
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(err)
    }
}

impl From<ApiMessage> for Record {
    fn from(msg: ApiMessage) -> Self {
        Record {
            order_key: snowflake_key(&msg.id),
            attachments: msg
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    id: a.id,
                    filename: a.filename,
                    size: a.size,
                    content_type: a.content_type,
                    url: Some(a.url),
                })
                .collect(),
            id: msg.id,
            content: msg.content,
            created_at: msg.timestamp,
        }
    }
}

impl ApiChannel {
    fn into_thread(self) -> ThreadInfo {
        ThreadInfo {
            created_at: snowflake_time(&self.id),
            channel_id: self.parent_id.unwrap_or_default(),
            name: self.name.unwrap_or_default(),
            id: self.id,
        }
    }

    fn into_channel(self) -> ChannelInfo {
        ChannelInfo {
            name: self.name.unwrap_or_default(),
            id: self.id,
        }
    }
}

/// Bot-authenticated client for one guild.
#[derive(Clone)]
pub struct DiscordTransport {
    client: Client,
    config: DiscordConfig,
}

impl DiscordTransport {
    pub fn new(config: DiscordConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .user_agent(concat!(
                "DiscordBot (thread-store, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .build()?;
        Ok(Self { client, config })
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.config.api_base, path))
            .header(header::AUTHORIZATION, format!("Bot {}", self.config.token))
            .timeout(self.config.request_timeout)
    }

    /// Send once and classify the status code.
    async fn send_once(request: RequestBuilder, what: &str) -> TransportResult<Response> {
        let response = request.send().await.map_err(map_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let header_hint = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok());
                let body_hint = response
                    .json::<ApiRateLimit>()
                    .await
                    .ok()
                    .map(|r| r.retry_after);
                let secs = body_hint.or(header_hint).unwrap_or(1.0).max(0.0);
                debug!(what, retry_after = secs, "rate limited by platform");
                Err(TransportError::RateLimited {
                    retry_after: Duration::from_secs_f64(secs),
                })
            }
            StatusCode::NOT_FOUND => Err(TransportError::NotFound(what.to_string())),
            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(TransportError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn call_json<T, B>(&self, what: &str, build: B) -> TransportResult<T>
    where
        T: DeserializeOwned,
        B: Fn() -> RequestBuilder,
    {
        retry_transport(&self.config.retry, what, || {
            let request = build();
            async move {
                let response = Self::send_once(request, what).await?;
                response.json::<T>().await.map_err(map_reqwest)
            }
        })
        .await
    }

    /// Like [`call_json`](Self::call_json) for requests that create
    /// something; only rate-limited attempts are sent again.
    async fn create_json<T, B>(&self, what: &str, build: B) -> TransportResult<T>
    where
        T: DeserializeOwned,
        B: Fn() -> RequestBuilder,
    {
        retry_unprocessed(&self.config.retry, what, || {
            let request = build();
            async move {
                let response = Self::send_once(request, what).await?;
                response.json::<T>().await.map_err(map_reqwest)
            }
        })
        .await
    }

    async fn call_empty<B>(&self, what: &str, build: B) -> TransportResult<()>
    where
        B: Fn() -> RequestBuilder,
    {
        retry_transport(&self.config.retry, what, || {
            let request = build();
            async move {
                Self::send_once(request, what).await?;
                Ok(())
            }
        })
        .await
    }

    /// Multipart message carrying one file; rebuilt for every attempt.
    fn upload_request(
        &self,
        thread_id: &str,
        payload: &str,
        filename: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> TransportResult<RequestBuilder> {
        let len = data.len() as u64;
        let mut part = Part::stream_with_length(reqwest::Body::from(data), len)
            .file_name(filename.to_string());
        if let Some(mime) = content_type {
            part = part.mime_str(mime)?;
        }
        let form = Form::new()
            .text("payload_json", payload.to_string())
            .part("files[0]", part);
        Ok(self
            .api(Method::POST, &format!("/channels/{thread_id}/messages"))
            .timeout(self.config.upload_timeout)
            .multipart(form))
    }

    async fn fetch_channel(&self, id: &str) -> TransportResult<ApiChannel> {
        let what = format!("channel {id}");
        self.call_json(&what, || self.api(Method::GET, &format!("/channels/{id}")))
            .await
    }

    async fn archived_threads(&self, channel_id: &str) -> TransportResult<Vec<ApiChannel>> {
        let mut threads = Vec::new();
        let mut before: Option<String> = None;
        loop {
            let mut path =
                format!("/channels/{channel_id}/threads/archived/public?limit={PAGE_SIZE}");
            if let Some(ts) = &before {
                path.push_str(&format!("&before={ts}"));
            }
            let page: ApiThreadList = self
                .call_json("archived threads", || self.api(Method::GET, &path))
                .await?;
            before = page
                .threads
                .last()
                .and_then(|t| t.thread_metadata.as_ref())
                .map(|m| m.archive_timestamp.clone());
            let more = page.has_more && before.is_some();
            threads.extend(page.threads);
            if !more {
                return Ok(threads);
            }
        }
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn health_check(&self) -> TransportResult<()> {
        let guild = self.config.guild_id.clone();
        let _: serde_json::Value = self
            .call_json("guild", || self.api(Method::GET, &format!("/guilds/{guild}")))
            .await?;
        Ok(())
    }

    async fn list_channels(&self) -> TransportResult<Vec<ChannelInfo>> {
        let guild = &self.config.guild_id;
        let channels: Vec<ApiChannel> = self
            .call_json("guild", || {
                self.api(Method::GET, &format!("/guilds/{guild}/channels"))
            })
            .await?;
        let mut text: Vec<ApiChannel> = channels
            .into_iter()
            .filter(|c| c.kind == GUILD_TEXT)
            .collect();
        text.sort_by_key(|c| snowflake_key(&c.id));
        Ok(text.into_iter().map(ApiChannel::into_channel).collect())
    }

    async fn get_channel(&self, channel_id: &str) -> TransportResult<ChannelInfo> {
        let channel = self.fetch_channel(channel_id).await?;
        if channel.kind != GUILD_TEXT {
            return Err(TransportError::NotFound(format!("channel {channel_id}")));
        }
        Ok(channel.into_channel())
    }

    async fn create_channel(&self, name: &str) -> TransportResult<ChannelInfo> {
        let guild = &self.config.guild_id;
        let body = json!({ "name": name, "type": GUILD_TEXT });
        let channel: ApiChannel = self
            .create_json(&format!("guild {guild}"), || {
                self.api(Method::POST, &format!("/guilds/{guild}/channels"))
                    .json(&body)
            })
            .await?;
        Ok(channel.into_channel())
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> TransportResult<ChannelInfo> {
        let body = json!({ "name": name });
        let channel: ApiChannel = self
            .call_json(&format!("channel {channel_id}"), || {
                self.api(Method::PATCH, &format!("/channels/{channel_id}"))
                    .json(&body)
            })
            .await?;
        Ok(channel.into_channel())
    }

    async fn delete_channel(&self, channel_id: &str) -> TransportResult<()> {
        self.get_channel(channel_id).await?;
        // The platform removes every thread of the channel along with it.
        self.call_empty(&format!("channel {channel_id}"), || {
            self.api(Method::DELETE, &format!("/channels/{channel_id}"))
        })
        .await
    }

    async fn list_threads(&self, channel_id: &str) -> TransportResult<Vec<ThreadInfo>> {
        self.get_channel(channel_id).await?;
        let guild = &self.config.guild_id;
        let active: ApiThreadList = self
            .call_json("active threads", || {
                self.api(Method::GET, &format!("/guilds/{guild}/threads/active"))
            })
            .await?;
        let archived = self.archived_threads(channel_id).await?;

        let mut seen = HashSet::new();
        let mut threads: Vec<ThreadInfo> = active
            .threads
            .into_iter()
            .filter(|t| t.parent_id.as_deref() == Some(channel_id))
            .chain(archived)
            .filter(|t| seen.insert(t.id.clone()))
            .map(ApiChannel::into_thread)
            .collect();
        threads.sort_by_key(|t| snowflake_key(&t.id));
        Ok(threads)
    }

    async fn get_thread(&self, channel_id: &str, thread_id: &str) -> TransportResult<ThreadInfo> {
        let thread = self.fetch_channel(thread_id).await?;
        if !THREAD_TYPES.contains(&thread.kind) || thread.parent_id.as_deref() != Some(channel_id)
        {
            return Err(TransportError::NotFound(format!("thread {thread_id}")));
        }
        Ok(thread.into_thread())
    }

    async fn create_thread(&self, channel_id: &str, name: &str) -> TransportResult<ThreadInfo> {
        let body = json!({
            "name": name,
            "type": PUBLIC_THREAD,
            "auto_archive_duration": AUTO_ARCHIVE_MINUTES,
        });
        let thread: ApiChannel = self
            .create_json(&format!("channel {channel_id}"), || {
                self.api(Method::POST, &format!("/channels/{channel_id}/threads"))
                    .json(&body)
            })
            .await?;
        Ok(thread.into_thread())
    }

    async fn delete_thread(&self, channel_id: &str, thread_id: &str) -> TransportResult<()> {
        self.get_thread(channel_id, thread_id).await?;
        self.call_empty(&format!("thread {thread_id}"), || {
            self.api(Method::DELETE, &format!("/channels/{thread_id}"))
        })
        .await
    }

    async fn send_text(&self, thread_id: &str, content: &str) -> TransportResult<Record> {
        let body = json!({ "content": content });
        let msg: ApiMessage = self
            .create_json(&format!("thread {thread_id}"), || {
                self.api(Method::POST, &format!("/channels/{thread_id}/messages"))
                    .json(&body)
            })
            .await?;
        Ok(msg.into())
    }

    async fn send_attachment(
        &self,
        thread_id: &str,
        content: Option<&str>,
        filename: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> TransportResult<Record> {
        let payload = json!({
            "content": content.unwrap_or_default(),
            "attachments": [{ "id": 0, "filename": filename }],
        })
        .to_string();

        let what = format!("thread {thread_id}");
        let msg: ApiMessage = retry_unprocessed(&self.config.retry, &what, || {
            let request =
                self.upload_request(thread_id, &payload, filename, content_type, data.clone());
            let what = what.as_str();
            async move {
                let response = Self::send_once(request?, what).await?;
                response.json::<ApiMessage>().await.map_err(map_reqwest)
            }
        })
        .await?;
        Ok(msg.into())
    }

    async fn fetch_records(&self, thread_id: &str) -> TransportResult<Vec<Record>> {
        // Pages arrive newest first; callers sort by order key.
        let mut records = Vec::new();
        let mut before: Option<String> = None;
        loop {
            let mut path = format!("/channels/{thread_id}/messages?limit={PAGE_SIZE}");
            if let Some(id) = &before {
                path.push_str(&format!("&before={id}"));
            }
            let page: Vec<ApiMessage> = self
                .call_json(&format!("thread {thread_id}"), || {
                    self.api(Method::GET, &path)
                })
                .await?;
            let full = page.len() == PAGE_SIZE;
            before = page
                .iter()
                .min_by_key(|m| snowflake_key(&m.id))
                .map(|m| m.id.clone());
            records.extend(page.into_iter().map(Record::from));
            if !full || before.is_none() {
                return Ok(records);
            }
        }
    }

    async fn fetch_head_records(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> TransportResult<Vec<Record>> {
        let limit = limit.clamp(1, PAGE_SIZE);
        let path = format!("/channels/{thread_id}/messages?after=0&limit={limit}");
        let page: Vec<ApiMessage> = self
            .call_json(&format!("thread {thread_id}"), || {
                self.api(Method::GET, &path)
            })
            .await?;
        Ok(page.into_iter().map(Record::from).collect())
    }

    async fn open_attachment(&self, attachment: &Attachment) -> TransportResult<AttachmentBody> {
        let url = attachment
            .url
            .clone()
            .ok_or_else(|| TransportError::Decode(format!("attachment {} has no url", attachment.id)))?;
        let what = format!("attachment {}", attachment.id);

        // CDN downloads are unauthenticated and bounded per chunk, not in total.
        let response = retry_transport(&self.config.retry, &what, || {
            let request = self.client.get(&url);
            let what = what.as_str();
            async move { Self::send_once(request, what).await }
        })
        .await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| attachment.content_type.clone());
        let content_length = response.content_length().or(Some(attachment.size));
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest))
            .boxed();

        Ok(AttachmentBody {
            content_type,
            content_length,
            stream: with_idle_timeout(stream, self.config.idle_timeout),
        })
    }

    fn handles_rate_limits(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::post};
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    /// Serve a fake message endpoint answering with `statuses` in turn,
    /// then 200. Returns a transport pointed at it and the POST counter.
    async fn fake_platform(statuses: Vec<u16>) -> (DiscordTransport, Arc<AtomicU32>) {
        let posts = Arc::new(AtomicU32::new(0));
        let counter = posts.clone();
        let app = Router::new().route(
            "/channels/{thread}/messages",
            post(move || {
                let counter = counter.clone();
                let statuses = statuses.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
                    match statuses.get(n) {
                        Some(&429) => (
                            AxumStatus::TOO_MANY_REQUESTS,
                            Json(json!({ "retry_after": 0.01 })),
                        ),
                        Some(&code) => (
                            AxumStatus::from_u16(code).unwrap(),
                            Json(json!({ "message": "fault" })),
                        ),
                        None => (
                            AxumStatus::OK,
                            Json(json!({
                                "id": "1200000000000000001",
                                "content": "a.txt",
                                "timestamp": "2024-05-01T10:00:00+00:00",
                                "attachments": []
                            })),
                        ),
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut config = DiscordConfig::new("token", "1");
        config.api_base = format!("http://{addr}");
        config.retry = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        };
        (DiscordTransport::new(config).unwrap(), posts)
    }

    #[tokio::test]
    async fn messages_are_not_posted_twice_after_a_server_fault() {
        let (transport, posts) = fake_platform(vec![502, 502]).await;

        let err = transport.send_text("5", "a.txt").await.unwrap_err();
        assert!(matches!(err, TransportError::Api { status: 502, .. }));
        assert_eq!(posts.load(Ordering::SeqCst), 1);

        let err = transport
            .send_attachment("5", None, "a.txt", None, Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Api { status: 502, .. }));
        assert_eq!(posts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limited_messages_are_posted_again() {
        let (transport, posts) = fake_platform(vec![429]).await;

        let record = transport.send_text("5", "a.txt").await.unwrap();
        assert_eq!(record.content, "a.txt");
        assert_eq!(posts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn snowflake_timestamps_decode() {
        // 175928847299117063 is the example id from the platform's documentation.
        let t = snowflake_time("175928847299117063");
        assert_eq!(t.timestamp_millis(), 1_462_015_105_796);
        assert_eq!(snowflake_time("not-a-number"), DateTime::<Utc>::default());
    }

    #[test]
    fn messages_convert_to_records() {
        let raw = r#"{
            "id": "1200000000000000001",
            "content": "Preview",
            "timestamp": "2024-05-01T10:00:00+00:00",
            "attachments": [{
                "id": "77",
                "filename": "preview.png",
                "size": 1234,
                "url": "https://cdn.example/preview.png",
                "content_type": "image/png"
            }]
        }"#;
        let record: Record = serde_json::from_str::<ApiMessage>(raw).unwrap().into();

        assert_eq!(record.order_key, 1_200_000_000_000_000_001);
        assert_eq!(record.content, "Preview");
        assert_eq!(record.attachments[0].size, 1234);
        assert_eq!(
            record.attachments[0].url.as_deref(),
            Some("https://cdn.example/preview.png")
        );
    }

    #[test]
    fn threads_keep_their_parent() {
        let raw = r#"{"id": "175928847299117063", "type": 11, "name": "a.zip", "parent_id": "42"}"#;
        let thread = serde_json::from_str::<ApiChannel>(raw).unwrap().into_thread();
        assert_eq!(thread.channel_id, "42");
        assert_eq!(thread.name, "a.zip");
    }
}
