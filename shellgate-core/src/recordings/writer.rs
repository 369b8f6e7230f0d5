use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::*;

use super::Error;
use crate::consts::RECORDING_BYTE_BUDGET;

/// Counts and hashes everything written through it, so the checksum
/// covers exactly the compressed bytes on disk.
struct HashingWriter<W: Write> {
    inner: W,
    digest: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            digest: Sha256::new(),
            written: 0,
        }
    }

    fn finalize(mut self) -> std::io::Result<(u64, String)> {
        self.inner.flush()?;
        let digest = self.digest.finalize();
        Ok((self.written, data_encoding::HEXLOWER.encode(&digest)))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug)]
pub struct FinalizedRecording {
    pub size_bytes: u64,
    pub checksum: String,
}

enum WriterCommand {
    Write(Bytes),
    Stop(oneshot::Sender<Result<FinalizedRecording, String>>),
}

/// Feeds a gzip encoder on a dedicated thread. The producer never blocks:
/// queued-but-unwritten bytes beyond the budget fail the write with
/// `Overflow` instead.
#[derive(Clone)]
pub struct RecordingWriter {
    sender: mpsc::Sender<WriterCommand>,
    queued_bytes: Arc<AtomicUsize>,
    overflowed: Arc<AtomicBool>,
}

impl RecordingWriter {
    pub fn new(path: PathBuf) -> Result<Self, Error> {
        let file = std::fs::File::create(&path)?;
        let mut encoder = GzEncoder::new(HashingWriter::new(file), Compression::default());

        let (sender, mut receiver) = mpsc::channel::<WriterCommand>(1024);
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        let overflowed = Arc::new(AtomicBool::new(false));

        let queued = queued_bytes.clone();
        std::thread::spawn(move || {
            while let Some(command) = receiver.blocking_recv() {
                match command {
                    WriterCommand::Write(bytes) => {
                        let len = bytes.len();
                        if let Err(error) = encoder.write_all(&bytes) {
                            error!(%error, ?path, "Failed to write recording");
                            queued.fetch_sub(len, Ordering::Relaxed);
                            break;
                        }
                        queued.fetch_sub(len, Ordering::Relaxed);
                    }
                    WriterCommand::Stop(reply) => {
                        let result = encoder
                            .finish()
                            .and_then(HashingWriter::finalize)
                            .map(|(size_bytes, checksum)| FinalizedRecording {
                                size_bytes,
                                checksum,
                            })
                            .map_err(|e| e.to_string());
                        let _ = reply.send(result);
                        return;
                    }
                }
            }
        });

        Ok(RecordingWriter {
            sender,
            queued_bytes,
            overflowed,
        })
    }

    pub fn write(&self, data: Bytes) -> Result<(), Error> {
        if self.overflowed.load(Ordering::Relaxed) {
            return Err(Error::Overflow);
        }
        let len = data.len();
        let queued = self.queued_bytes.fetch_add(len, Ordering::Relaxed) + len;
        if queued > RECORDING_BYTE_BUDGET {
            self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
            self.overflowed.store(true, Ordering::Relaxed);
            return Err(Error::Overflow);
        }
        match self.sender.try_send(WriterCommand::Write(data)) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
                self.overflowed.store(true, Ordering::Relaxed);
                Err(Error::Overflow)
            }
        }
    }

    /// Flushes, closes the gzip stream and returns size and sha256 of the
    /// artifact.
    pub async fn finalize(&self) -> Result<FinalizedRecording, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(WriterCommand::Stop(reply_tx))
            .await
            .map_err(|_| Error::Closed)?;
        match reply_rx.await {
            Ok(Ok(finalized)) => Ok(finalized),
            Ok(Err(message)) => Err(Error::Io(std::io::Error::other(message))),
            Err(_) => Err(Error::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[tokio::test]
    async fn written_bytes_survive_gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.gz");
        let writer = RecordingWriter::new(path.clone()).unwrap();

        writer.write(Bytes::from_static(b"hello ")).unwrap();
        writer.write(Bytes::from_static(b"world\n")).unwrap();
        let finalized = writer.finalize().await.unwrap();

        let compressed = std::fs::read(&path).unwrap();
        assert_eq!(compressed.len() as u64, finalized.size_bytes);

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world\n");
    }

    #[tokio::test]
    async fn checksum_covers_compressed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.gz");
        let writer = RecordingWriter::new(path.clone()).unwrap();
        writer.write(Bytes::from_static(b"data")).unwrap();
        let finalized = writer.finalize().await.unwrap();

        let compressed = std::fs::read(&path).unwrap();
        let digest = Sha256::digest(&compressed);
        assert_eq!(
            finalized.checksum,
            data_encoding::HEXLOWER.encode(&digest)
        );
    }

    #[tokio::test]
    async fn oversized_write_overflows_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RecordingWriter::new(dir.path().join("rec.gz")).unwrap();
        let chunk = Bytes::from(vec![0u8; RECORDING_BYTE_BUDGET + 1]);
        assert!(matches!(writer.write(chunk), Err(Error::Overflow)));
        // Overflow is sticky.
        assert!(matches!(
            writer.write(Bytes::from_static(b"x")),
            Err(Error::Overflow)
        ));
    }
}
