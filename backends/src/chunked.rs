//! Resumable chunked upload of part files through an upload session.
//!
//! Each part gets a fresh session. Chunks go out one at a time, and after
//! every partial response the next chunk starts exactly where the server says
//! it wants to continue.

use crate::credentials::AccessTokenSource;
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tidevault_core::{Error, PartUploader, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSession {
    #[serde(rename = "uploadUrl")]
    pub upload_url: String,
}

/// Inclusive byte range of one chunk within a file of `total` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ChunkRange {
    pub fn new(start: u64, chunk_size: u64, total: u64) -> Self {
        let end = (start + chunk_size).min(total) - 1;
        Self { start, end, total }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResponse {
    /// 200 or 201: the file is complete.
    Complete,
    /// 202: more data expected, starting at the first declared range.
    Partial { next_expected: Vec<String> },
    Rejected { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct PartialBody {
    #[serde(rename = "nextExpectedRanges", default)]
    next_expected_ranges: Vec<String>,
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn create_session(&self, remote_path: &str, access_token: &str) -> Result<UploadSession>;

    async fn put_chunk(&self, session: &UploadSession, range: ChunkRange, body: Bytes) -> Result<ChunkResponse>;
}

/// Microsoft Graph drive upload sessions.
pub struct GraphTransport {
    http: Client,
    api_base: String,
}

impl GraphTransport {
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UploadTransport for GraphTransport {
    async fn create_session(&self, remote_path: &str, access_token: &str) -> Result<UploadSession> {
        let url = format!("{}/me/drive/root:/{}:/createUploadSession", self.api_base, remote_path);
        let transport_err = |e: reqwest::Error| Error::Transport {
            context: "create upload session".to_string(),
            message: e.to_string(),
        };

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .json(&serde_json::json!({
                "item": { "@microsoft.graph.conflictBehavior": "rename" }
            }))
            .send()
            .await
            .map_err(transport_err)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_err)?;
        if status != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                context: format!("create upload session for {}", remote_path),
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::Protocol(format!("upload session response: {}", e)))
    }

    async fn put_chunk(&self, session: &UploadSession, range: ChunkRange, body: Bytes) -> Result<ChunkResponse> {
        let transport_err = |e: reqwest::Error| Error::Transport {
            context: format!("chunk {}", range.header_value()),
            message: e.to_string(),
        };

        let response = self
            .http
            .put(&session.upload_url)
            .header(CONTENT_RANGE, range.header_value())
            .header(CONTENT_LENGTH, range.len())
            .body(body)
            .send()
            .await
            .map_err(transport_err)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_err)?;

        Ok(match status {
            StatusCode::OK | StatusCode::CREATED => ChunkResponse::Complete,
            StatusCode::ACCEPTED => {
                let parsed: PartialBody = serde_json::from_str(&text)
                    .map_err(|e| Error::Protocol(format!("partial upload response: {}", e)))?;
                ChunkResponse::Partial {
                    next_expected: parsed.next_expected_ranges,
                }
            }
            other => ChunkResponse::Rejected {
                status: other.as_u16(),
                body: text,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub chunk_size: u64,
    pub retry: RetryConfig,
    /// Remote folder the parts land in.
    pub remote_folder: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryConfig::chunk_upload(),
            remote_folder: String::new(),
        }
    }
}

enum ChunkStep {
    Complete,
    ResumeAt(u64),
}

pub struct ChunkedUploader {
    transport: Arc<dyn UploadTransport>,
    tokens: Arc<dyn AccessTokenSource>,
    config: UploadConfig,
}

impl ChunkedUploader {
    pub fn new(transport: Arc<dyn UploadTransport>, tokens: Arc<dyn AccessTokenSource>, config: UploadConfig) -> Self {
        Self {
            transport,
            tokens,
            config,
        }
    }

    fn remote_path(&self, file_name: &str) -> String {
        let folder = self.config.remote_folder.trim_matches('/');
        if folder.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", folder, file_name)
        }
    }

    async fn send_chunk(&self, session: &UploadSession, range: ChunkRange, body: Bytes) -> Result<ChunkStep> {
        retry_with_backoff(&self.config.retry, "chunk upload", || {
            let body = body.clone();
            async move {
                match self.transport.put_chunk(session, range, body).await? {
                    ChunkResponse::Complete => Ok(ChunkStep::Complete),
                    ChunkResponse::Partial { next_expected } => {
                        let next = next_offset(&next_expected, range)?;
                        if next == range.start {
                            return Err(Error::ChunkRejected {
                                offset: range.start,
                                status: StatusCode::ACCEPTED.as_u16(),
                                body: format!("server still expects {:?}", next_expected),
                            });
                        }
                        Ok(ChunkStep::ResumeAt(next))
                    }
                    ChunkResponse::Rejected { status, body } => Err(Error::ChunkRejected {
                        offset: range.start,
                        status,
                        body,
                    }),
                }
            }
        })
        .await
    }
}

/// First declared offset of a partial response. A declaration at or past the
/// end of the file is a protocol violation.
fn next_offset(next_expected: &[String], range: ChunkRange) -> Result<u64> {
    let first = next_expected
        .first()
        .ok_or_else(|| Error::Protocol(format!("partial response after {} declares no next range", range.header_value())))?;
    let start = first.split('-').next().unwrap_or_default();
    let offset: u64 = start
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("malformed next expected range '{}'", first)))?;

    if offset >= range.total {
        return Err(Error::Protocol(format!(
            "server expects offset {} of a {}-byte file",
            offset, range.total
        )));
    }
    Ok(offset)
}

async fn read_chunk(file: &mut tokio::fs::File, path: &Path, range: ChunkRange) -> Result<Bytes> {
    let mut buf = vec![0u8; range.len() as usize];
    file.seek(SeekFrom::Start(range.start))
        .await
        .map_err(|e| Error::path(path, e))?;
    file.read_exact(&mut buf).await.map_err(|e| Error::path(path, e))?;
    Ok(Bytes::from(buf))
}

#[async_trait]
impl PartUploader for ChunkedUploader {
    async fn upload_part(&self, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::Config(format!("{} has no file name", path.display())))?;
        let remote_path = self.remote_path(&file_name);

        let mut file = tokio::fs::File::open(path).await.map_err(|e| Error::path(path, e))?;
        let total = file.metadata().await.map_err(|e| Error::path(path, e))?.len();
        if total == 0 {
            return Err(Error::Protocol(format!("refusing to upload empty file {}", path.display())));
        }

        let token = self.tokens.fresh_token().await?;
        let session = self.transport.create_session(&remote_path, &token).await?;
        info!(remote = %remote_path, bytes = total, "Upload session created");

        let chunk_size = self.config.chunk_size.max(1);
        let max_regressions = self.config.retry.max_attempts;
        let mut regressions = 0;
        let mut start = 0u64;

        loop {
            let range = ChunkRange::new(start, chunk_size, total);
            let body = read_chunk(&mut file, path, range).await?;

            match self.send_chunk(&session, range, body).await? {
                ChunkStep::Complete => {
                    info!(remote = %remote_path, bytes = total, "Upload complete");
                    return Ok(());
                }
                ChunkStep::ResumeAt(next) => {
                    if next < range.start {
                        regressions += 1;
                        warn!(offset = range.start, next, "Server asked to resend earlier bytes");
                        if regressions > max_regressions {
                            return Err(Error::Protocol(format!(
                                "server kept rewinding the upload of {} (last to offset {})",
                                remote_path, next
                            )));
                        }
                    }
                    debug!(
                        remote = %remote_path,
                        next,
                        percent = next * 100 / total,
                        "Chunk accepted"
                    );
                    start = next;
                }
            }
        }
    }
}
