//! Destinations for received bytes.
//!
//! A [`Sink`] owns exactly one destination for the lifetime of a transfer:
//! either a file opened at a byte offset or a channel to a stream
//! consumer. Callers must finish it with [`Sink::close`] or
//! [`Sink::error_close`].

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::DataChannelError;

/// Item delivered to a stream consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk and the running byte count including it.
    Data { chunk: Vec<u8>, received: u64 },
    /// The peer closed the connection normally.
    Finished { received: u64 },
    /// The transfer failed; no more data follows.
    Failed(String),
}

/// Writes a transfer to disk.
#[derive(Debug)]
pub struct FileSink {
    file: File,
    path: PathBuf,
    written: u64,
}

impl FileSink {
    /// Creates (or truncates) `path`.
    pub async fn create(path: &Path) -> Result<Self, DataChannelError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        debug!(path = %path.display(), "file sink created");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    /// Re-opens an existing partial file for writing at `offset`.
    ///
    /// Bytes before `offset` are kept; bytes after it are overwritten as
    /// the transfer proceeds.
    pub async fn open_at(path: &Path, offset: u64) -> Result<Self, DataChannelError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        debug!(path = %path.display(), offset, "file sink reopened for resume");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        })
    }
}

/// Pushes a transfer to a consumer over a channel.
#[derive(Debug)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
    received: u64,
}

impl StreamSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx, received: 0 }
    }
}

/// Destination of one transfer.
#[derive(Debug)]
pub enum Sink {
    File(FileSink),
    Stream(StreamSink),
}

impl Sink {
    /// Appends a chunk, in order.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), DataChannelError> {
        match self {
            Self::File(sink) => {
                sink.file.write_all(chunk).await?;
                sink.written += chunk.len() as u64;
            }
            Self::Stream(sink) => {
                sink.received += chunk.len() as u64;
                sink.tx
                    .send(StreamEvent::Data {
                        chunk: chunk.to_vec(),
                        received: sink.received,
                    })
                    .await
                    .map_err(|_| DataChannelError::SinkClosed)?;
            }
        }
        Ok(())
    }

    /// Flushes and releases the destination after a successful transfer.
    pub async fn close(self) -> Result<(), DataChannelError> {
        match self {
            Self::File(mut sink) => {
                sink.file.flush().await?;
                sink.file.sync_all().await?;
                debug!(path = %sink.path.display(), written = sink.written, "file sink closed");
            }
            Self::Stream(sink) => {
                sink.tx
                    .send(StreamEvent::Finished {
                        received: sink.received,
                    })
                    .await
                    .map_err(|_| DataChannelError::SinkClosed)?;
            }
        }
        Ok(())
    }

    /// Releases the destination after a failure.
    ///
    /// File contents written so far are flushed and kept so a later
    /// attempt can resume from them.
    pub async fn error_close(self, reason: &str) {
        match self {
            Self::File(mut sink) => {
                if let Err(e) = sink.file.flush().await {
                    debug!(path = %sink.path.display(), error = %e, "flush after failure failed");
                }
            }
            Self::Stream(sink) => {
                // A consumer that stopped reading must not hold up the failure.
                if sink.tx.try_send(StreamEvent::Failed(reason.to_string())).is_err() {
                    debug!(received = sink.received, "stream consumer not told about failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_sink_writes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/out.bin");

        let mut sink = Sink::File(FileSink::create(&path).await.unwrap());
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn file_sink_resumes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"AAAAXXXX").unwrap();

        let mut sink = Sink::File(FileSink::open_at(&path, 4).await.unwrap());
        sink.write(b"BBBBCC").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"AAAABBBBCC");
    }

    #[tokio::test]
    async fn error_close_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.bin");

        let mut sink = Sink::File(FileSink::create(&path).await.unwrap());
        sink.write(b"partial").await.unwrap();
        sink.error_close("connection reset").await;

        assert_eq!(std::fs::read(&path).unwrap(), b"partial");
    }

    #[tokio::test]
    async fn stream_sink_forwards_running_total() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut sink = Sink::Stream(StreamSink::new(tx));
        sink.write(b"abc").await.unwrap();
        sink.write(b"de").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::Data {
                chunk: b"abc".to_vec(),
                received: 3
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::Data {
                chunk: b"de".to_vec(),
                received: 5
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::Finished { received: 5 }
        );
    }

    #[tokio::test]
    async fn stream_sink_reports_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = Sink::Stream(StreamSink::new(tx));
        sink.error_close("timeout").await;
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::Failed("timeout".into())
        );
    }

    #[tokio::test]
    async fn error_close_does_not_wait_for_stalled_consumer() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = Sink::Stream(StreamSink::new(tx));
        sink.write(b"x").await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), sink.error_close("cancelled"))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(StreamEvent::Data { .. })));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_sink_detects_dropped_consumer() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let mut sink = Sink::Stream(StreamSink::new(tx));
        assert!(matches!(
            sink.write(b"x").await,
            Err(DataChannelError::SinkClosed)
        ));
    }
}
