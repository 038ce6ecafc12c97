//! Byte sources for the stream parser
//!
//! A source is pulled one chunk at a time. Local files and HTTP response
//! bodies are the two production sources; [`MemorySource`] replays
//! pre-split chunks.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use gridstream_common::{GridError, Result};
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Default read size for file and reader sources (64 KiB).
pub const DEFAULT_READ_CHUNK_BYTES: usize = 64 * 1024;

/// Raw bytes received from a source, consumed once by the parser.
pub type ByteChunk = Vec<u8>;

/// Pull-based byte stream.
#[async_trait]
pub trait ByteSource: Send {
    /// Read the next chunk, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<ByteChunk>>;

    /// Declared total size in bytes, when the source knows it.
    fn total_size(&self) -> Option<u64> {
        None
    }
}

#[async_trait]
impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    async fn next_chunk(&mut self) -> Result<Option<ByteChunk>> {
        (**self).next_chunk().await
    }

    fn total_size(&self) -> Option<u64> {
        (**self).total_size()
    }
}

/// In-memory source replaying chunks in order.
#[derive(Debug, Default)]
pub struct MemorySource {
    chunks: VecDeque<ByteChunk>,
    total: u64,
}

impl MemorySource {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ByteChunk>,
    {
        let chunks: VecDeque<ByteChunk> = chunks.into_iter().map(Into::into).collect();
        let total = chunks.iter().map(|c| c.len() as u64).sum();
        Self { chunks, total }
    }

    /// Split `data` into chunks of at most `chunk_len` bytes.
    pub fn split(data: &[u8], chunk_len: usize) -> Self {
        Self::new(data.chunks(chunk_len.max(1)).map(<[u8]>::to_vec))
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn next_chunk(&mut self) -> Result<Option<ByteChunk>> {
        Ok(self.chunks.pop_front())
    }

    fn total_size(&self) -> Option<u64> {
        Some(self.total)
    }
}

/// Source over any async reader: files, stdin, pipes.
pub struct ReaderSource<R> {
    stream: ReaderStream<R>,
    total: Option<u64>,
}

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
    pub fn new(reader: R, chunk_bytes: usize) -> Self {
        Self {
            stream: ReaderStream::with_capacity(reader, chunk_bytes.max(1)),
            total: None,
        }
    }

    pub fn with_total_size(mut self, total: Option<u64>) -> Self {
        self.total = total;
        self
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for ReaderSource<R> {
    async fn next_chunk(&mut self) -> Result<Option<ByteChunk>> {
        match self.stream.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes.to_vec())),
            Some(Err(err)) => Err(GridError::transport(format!("read failed: {err}"))),
            None => Ok(None),
        }
    }

    fn total_size(&self) -> Option<u64> {
        self.total
    }
}

/// Local file source; the total size comes from file metadata.
pub type FileSource = ReaderSource<tokio::fs::File>;

impl FileSource {
    pub async fn open(path: impl AsRef<Path>, chunk_bytes: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| GridError::transport(format!("cannot open {}: {e}", path.display())))?;
        let total = file.metadata().await.ok().map(|m| m.len());
        debug!(path = %path.display(), total_bytes = ?total, "Opened file source");
        Ok(Self::new(file, chunk_bytes).with_total_size(total))
    }
}

/// HTTP response body source; the total size comes from `Content-Length`.
pub struct HttpSource {
    body: BoxStream<'static, reqwest::Result<ByteChunk>>,
    total: Option<u64>,
}

impl HttpSource {
    /// Issue a GET request and stream its body.
    pub async fn open(client: &reqwest::Client, url: &str) -> Result<Self> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| GridError::transport(format!("request to {url} failed: {e}")))?;

        Self::from_response(response)
    }

    /// Wrap an already received response. Non-success statuses are transport failures.
    pub fn from_response(response: reqwest::Response) -> Result<Self> {
        let status = response.status();
        if !status.is_success() {
            return Err(GridError::transport(format!(
                "unexpected status {} from {}",
                status,
                response.url()
            )));
        }

        let total = response.content_length();
        debug!(url = %response.url(), total_bytes = ?total, "Opened HTTP source");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(Self { body, total })
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn next_chunk(&mut self) -> Result<Option<ByteChunk>> {
        match self.body.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(err)) => Err(GridError::transport(format!("body read failed: {err}"))),
            None => Ok(None),
        }
    }

    fn total_size(&self) -> Option<u64> {
        self.total
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_replays_in_order() {
        let mut source = MemorySource::split(b"abcdefg", 3);
        assert_eq!(source.total_size(), Some(7));
        assert_eq!(source.next_chunk().await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(source.next_chunk().await.unwrap(), Some(b"def".to_vec()));
        assert_eq!(source.next_chunk().await.unwrap(), Some(b"g".to_vec()));
        assert_eq!(source.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_source_respects_chunk_size() {
        let data: &[u8] = b"0123456789";
        let mut source = ReaderSource::new(data, 4);
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            assert!(chunk.len() <= 4);
            chunks.extend(chunk);
        }
        assert_eq!(chunks, data);
        assert_eq!(source.total_size(), None);
    }

    #[tokio::test]
    async fn test_file_source_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        let mut source = FileSource::open(&path, 3).await.unwrap();
        assert_eq!(source.total_size(), Some(8));

        let mut read = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            read.extend(chunk);
        }
        assert_eq!(read, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_a_transport_failure() {
        let result = FileSource::open("/definitely/not/here.csv", 16).await;
        assert!(matches!(result, Err(GridError::Transport(_))));
    }
}
