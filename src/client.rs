//! HTTP client for the coordinator API
//!
//! Used by the `distsync` CLI and the benchmark. Uploads stream from any
//! `AsyncRead` without buffering the whole file; downloads are hashed as
//! they are written and checked against the checksum header.

use crate::common::{
    encode_key, Blake3Hasher, Error, ErrorBody, FileSummary, NodeId, Result, CHECKSUM_HEADER,
};
use crate::coordinator::{ClusterStatus, FileRecord};
use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{Stream, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_BUFFER: usize = 256 * 1024;

/// Per-request upload settings sent as query parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadParams {
    /// Ask the coordinator to replicate one chunk at a time
    pub sequential: bool,
    pub pipeline_depth: Option<usize>,
    pub deadline: Option<Duration>,
}

impl UploadParams {
    pub fn sequential() -> Self {
        Self {
            sequential: true,
            ..Default::default()
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if self.sequential {
            query.push(("sequential", "true".to_string()));
        }
        if let Some(depth) = self.pipeline_depth {
            query.push(("pipeline_depth", depth.to_string()));
        }
        if let Some(deadline) = self.deadline {
            query.push(("deadline_ms", deadline.as_millis().to_string()));
        }
        query
    }
}

/// Outcome of a verified download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub bytes: u64,
    pub checksum: String,
}

#[derive(Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(coordinator_url: &str) -> Self {
        Self::with_http(coordinator_url, reqwest::Client::new())
    }

    pub fn with_http(coordinator_url: &str, http: reqwest::Client) -> Self {
        let base = coordinator_url.trim_end_matches('/');
        let base_url = if base.starts_with("http://") || base.starts_with("https://") {
            base.to_string()
        } else {
            format!("http://{}", base)
        };
        Self { base_url, http }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn file_url(&self, filename: &str) -> String {
        format!("{}/files/{}", self.base_url, encode_key(filename))
    }

    /// Turn a non-2xx response into the error the coordinator reported.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(match resp.json::<ErrorBody>().await {
            Ok(body) => Error::from_body(body),
            Err(_) => Error::Http(format!("coordinator returned HTTP {}", status)),
        })
    }

    /// Stream `reader` to the coordinator as `filename`.
    pub async fn upload<R>(
        &self,
        filename: &str,
        reader: R,
        params: UploadParams,
    ) -> Result<FileSummary>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let body = reqwest::Body::wrap_stream(read_stream(reader, READ_BUFFER));
        let resp = self
            .http
            .put(self.file_url(filename))
            .query(&params.query())
            .body(body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn upload_bytes(
        &self,
        filename: &str,
        data: impl Into<Bytes>,
        params: UploadParams,
    ) -> Result<FileSummary> {
        let resp = self
            .http
            .put(self.file_url(filename))
            .query(&params.query())
            .body(data.into())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn upload_file(
        &self,
        filename: &str,
        path: &Path,
        params: UploadParams,
    ) -> Result<FileSummary> {
        let file = tokio::fs::File::open(path).await?;
        self.upload(filename, file, params).await
    }

    /// Download `filename` into `writer`, failing with `ChecksumMismatch`
    /// if the bytes do not hash to the advertised checksum.
    ///
    /// An unreadable first chunk arrives as `ReplicaExhausted`; a later one
    /// cuts the body short and surfaces as `Http`.
    pub async fn download_to<W>(&self, filename: &str, writer: &mut W) -> Result<DownloadReport>
    where
        W: AsyncWrite + Unpin,
    {
        let resp = self.http.get(self.file_url(filename)).send().await?;
        let resp = Self::check(resp).await?;
        let expected = resp
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut hasher = Blake3Hasher::new();
        let mut bytes = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(piece) = stream.next().await {
            // The coordinator aborts the body if a later chunk is unreadable
            let piece = piece.map_err(|e| {
                Error::Http(format!("download interrupted after {} bytes: {}", bytes, e))
            })?;
            hasher.update(&piece);
            writer.write_all(&piece).await?;
            bytes += piece.len() as u64;
        }
        writer.flush().await?;

        let checksum = hasher.finalize();
        if let Some(expected) = expected {
            if expected != checksum {
                return Err(Error::ChecksumMismatch {
                    expected,
                    actual: checksum,
                });
            }
        }
        Ok(DownloadReport { bytes, checksum })
    }

    /// Download to `path`. A partially written file is removed on failure.
    pub async fn download_file(&self, filename: &str, path: &Path) -> Result<DownloadReport> {
        let mut file = tokio::fs::File::create(path).await?;
        match self.download_to(filename, &mut file).await {
            Ok(report) => {
                file.sync_all().await?;
                Ok(report)
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(path).await;
                Err(e)
            }
        }
    }

    pub async fn download_bytes(&self, filename: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.download_to(filename, &mut out).await?;
        Ok(out)
    }

    pub async fn delete(&self, filename: &str) -> Result<()> {
        let resp = self.http.delete(self.file_url(filename)).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<FileSummary>> {
        let resp = self
            .http
            .get(format!("{}/files", self.base_url))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Full record including chunk placement.
    pub async fn meta(&self, filename: &str) -> Result<FileRecord> {
        let resp = self
            .http
            .get(format!("{}/meta", self.file_url(filename)))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn cluster_status(&self) -> Result<ClusterStatus> {
        let resp = self
            .http
            .get(format!("{}/cluster/status", self.base_url))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn decommission(&self, node_id: &NodeId) -> Result<()> {
        let resp = self
            .http
            .post(format!(
                "{}/nodes/{}/decommission",
                self.base_url,
                encode_key(node_id)
            ))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

fn read_stream<R>(mut reader: R, buf_size: usize) -> impl Stream<Item = Result<Bytes>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    try_stream! {
        loop {
            let mut buf = BytesMut::with_capacity(buf_size);
            let n = reader.read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield buf.freeze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    #[test]
    fn test_base_url_normalized() {
        assert_eq!(Client::new("127.0.0.1:5000/").base_url(), "http://127.0.0.1:5000");
        assert_eq!(
            Client::new("https://coord.example").base_url(),
            "https://coord.example"
        );
    }

    #[test]
    fn test_file_url_encodes_name() {
        let client = Client::new("http://localhost:5000");
        assert_eq!(
            client.file_url("dir/a b.bin"),
            "http://localhost:5000/files/dir%2Fa%20b.bin"
        );
    }

    #[test]
    fn test_upload_query() {
        assert!(UploadParams::default().query().is_empty());
        let params = UploadParams {
            sequential: true,
            pipeline_depth: None,
            deadline: Some(Duration::from_millis(1500)),
        };
        assert_eq!(
            params.query(),
            vec![
                ("sequential", "true".to_string()),
                ("deadline_ms", "1500".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_read_stream_covers_input() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let pieces: Vec<Bytes> = read_stream(std::io::Cursor::new(data.clone()), 1024)
            .try_collect()
            .await
            .unwrap();
        assert!(pieces.iter().all(|p| p.len() <= 1024));
        assert_eq!(pieces.concat(), data);
    }
}
