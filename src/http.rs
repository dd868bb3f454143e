//! Streaming download of yearly archives. The response body is exposed as
//! an `AsyncRead` over the network chunks; nothing buffers the whole file.

use futures::TryStreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use std::io;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::info;

use crate::io::{charset_from_content_type, CsvMeta};
use crate::{IngestError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-read timeout on the response body: a stalled connection surfaces
/// as a year-level error instead of hanging the import.
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("dvf-ingest/", env!("CARGO_PKG_VERSION"));

/// Thin wrapper around a shared `reqwest` client.
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        Self::with_timeouts(CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    pub fn with_timeouts(connect: Duration, read: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .read_timeout(read)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// GET the archive at `url` and return its body as a raw byte reader
    /// plus meta derived from the response headers (falling back to the
    /// URL's file extension). Non-2xx responses are an error for the year,
    /// surfaced before any byte is pulled.
    pub async fn open(&self, url: &str) -> Result<(impl AsyncRead + Unpin + Send, CsvMeta)> {
        info!(url, "starting download");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let header_str = |name| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let name_hint = url.rsplit('/').next().unwrap_or_default().to_string();
        let content_type = header_str(CONTENT_TYPE);
        let charset =
            charset_from_content_type(&content_type).unwrap_or(encoding_rs::UTF_8);
        let meta = CsvMeta {
            content_type,
            content_encoding: header_str(CONTENT_ENCODING),
            charset,
            ..CsvMeta::from_name_hint(name_hint)
        };

        if let Some(len) = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            info!(
                url,
                size_mb = len / (1024 * 1024),
                "response streaming"
            );
        }

        let stream = resp.bytes_stream().map_err(io::Error::other);
        Ok((StreamReader::new(Box::pin(stream)), meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_response_errors_instead_of_hanging() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept the connection, then go silent without ever responding.
        let server = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let dl = Downloader::with_timeouts(Duration::from_secs(1), Duration::from_millis(200))
            .unwrap();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            dl.open(&format!("http://{addr}/2024/full.csv.gz")),
        )
        .await
        .expect("request must give up on a dead connection");
        assert!(res.is_err());
        server.abort();
    }
}
