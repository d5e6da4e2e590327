//! Bridging async blob streams into blocking cache writes, and cached blobs
//! back into upload streams.

use std::io::{self, Read};
use std::path::PathBuf;

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use kiln_common::{KilnError, KilnResult};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::registry::BlobStream;

/// Chunks buffered between the network task and the cache writer.
pub const CHANNEL_CAPACITY: usize = 16;

/// Largest chunk read from disk per [`file_stream`] item.
pub const READ_CHUNK: usize = 64 * 1024;

/// Blocking [`Read`] over chunks sent through a bounded channel.
///
/// Errors sent by the producer surface as [`io::Error`]s wrapping the original
/// [`KilnError`], which the cache unwraps again.
pub struct ChannelReader {
    rx: mpsc::Receiver<KilnResult<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    /// Create a reader and the sender that feeds it.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<KilnResult<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            tx,
            Self {
                rx,
                current: Bytes::new(),
            },
        )
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while !self.current.has_remaining() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(io::Error::other(e)),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.remaining());
        self.current.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

/// Forward `stream` into `tx`, calling `on_chunk` with each chunk's length.
///
/// Stops early, without error, when the reader side hung up.
pub async fn forward<S>(
    mut stream: S,
    tx: mpsc::Sender<KilnResult<Bytes>>,
    mut on_chunk: impl FnMut(u64) + Send,
) where
    S: Stream<Item = KilnResult<Bytes>> + Unpin,
{
    while let Some(item) = stream.next().await {
        let failed = item.is_err();
        if let Ok(chunk) = &item {
            on_chunk(chunk.len() as u64);
        }
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

/// Collect a stream fully into memory. Used for small blobs such as configs.
///
/// # Errors
///
/// Returns the first error yielded by the stream.
pub async fn collect<S>(mut stream: S) -> KilnResult<Vec<u8>>
where
    S: Stream<Item = KilnResult<Bytes>> + Unpin,
{
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Stream a file in chunks of at most [`READ_CHUNK`] bytes.
///
/// # Errors
///
/// Returns [`KilnError::CacheIo`] if the file cannot be opened; read failures
/// are yielded by the stream.
pub async fn file_stream(path: impl Into<PathBuf>) -> KilnResult<BlobStream> {
    let path = path.into();
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| KilnError::cache_io(&path, e))?;
    Ok(futures::stream::try_unfold((file, path), |(mut file, path)| async move {
        let mut chunk = BytesMut::with_capacity(READ_CHUNK);
        let n = file
            .read_buf(&mut chunk)
            .await
            .map_err(|e| KilnError::cache_io(&path, e))?;
        Ok((n > 0).then(|| (chunk.freeze(), (file, path))))
    })
    .boxed())
}

/// Network error helper for stream adapters.
pub(crate) fn network_error(e: impl std::fmt::Display) -> KilnError {
    KilnError::Network {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn chunks_arrive_in_order() {
        let (tx, mut reader) = ChannelReader::channel();
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"")),
            Ok(Bytes::from_static(b"world")),
        ];
        let mut seen = 0;
        forward(futures::stream::iter(chunks), tx, |n| seen += n).await;
        assert_eq!(seen, 11);

        let out = tokio::task::spawn_blocking(move || {
            let mut out = String::new();
            reader.read_to_string(&mut out).map(|_| out)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn producer_errors_reach_the_reader() {
        let (tx, mut reader) = ChannelReader::channel();
        tx.send(Err(network_error("reset"))).await.unwrap();
        drop(tx);

        let err = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap_err()
        })
        .await
        .unwrap();
        assert!(err.get_ref().unwrap().is::<KilnError>());
    }

    #[tokio::test]
    async fn file_stream_reads_in_bounded_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..READ_CHUNK * 2 + 100).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let chunks: Vec<Bytes> = file_stream(&path)
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|chunk| chunk.len() <= READ_CHUNK));
        assert_eq!(chunks.concat(), data);
    }

    #[tokio::test]
    async fn file_stream_of_missing_file_is_a_cache_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = file_stream(dir.path().join("gone")).await.err().unwrap();
        assert!(matches!(err, KilnError::CacheIo { .. }));
    }

    #[tokio::test]
    async fn collect_concatenates() {
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"c")),
        ]);
        assert_eq!(collect(stream).await.unwrap(), b"abc");
    }
}
