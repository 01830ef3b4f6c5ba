//! Decrypt a firmware download and extract its archive while it is still
//! arriving.
//!
//! The pipeline has two stages connected by a bounded channel. The async
//! ingest stage reads the network stream, counts encrypted bytes against the
//! expected size and forwards them. The blocking extract stage decrypts the
//! bytes block by block and feeds the plaintext to a streaming zip parser,
//! which writes every entry to its own file. A full channel stops the ingest
//! stage from reading more, so the network read never runs ahead of the disk.

use std::{
    cmp,
    collections::BTreeMap,
    fmt,
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use log::{debug, trace, warn};
use thiserror::Error;
use tokio::{sync::mpsc, task};
use tokio_util::sync::CancellationToken;

use progresslib::ProgressTracker;

use crate::{
    central::{self, EntryRecord},
    crypto::{FirmwareCipher, FirmwareKey},
    file::{self, PartFile},
};

/// Number of network chunks that may be queued for the extract stage
const CHANNEL_CAPACITY: usize = 16;
/// Ciphertext read per decryption round
const DECRYPT_BUF_SIZE: usize = 64 * 1024;
/// Buffer for copying entry data to disk
const COPY_BUF_SIZE: usize = 64 * 1024;
/// Upper bound for everything after the last entry
const MAX_DIRECTORY_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum UnwrapError {
    #[error("Download incomplete after {received} of {expected} bytes: {cause}")]
    IncompleteDownload {
        received: u64,
        expected: u64,
        cause: String,
    },
    #[error("Corrupt firmware archive: {0}")]
    CorruptArchive(String),
    #[error("Extraction was cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result of a successful run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnwrapSummary {
    /// Files written, relative to the output directory, in archive order
    pub entries: Vec<PathBuf>,
    /// Encrypted bytes consumed. Always the expected size
    pub bytes_received: u64,
}

/// Why the ingest stage stopped early.
#[derive(Debug)]
enum IngestError {
    Cancelled,
    Short {
        received: u64,
        cause: String,
    },
    Overrun(u64),
    ExtractorStopped,
}

/// Decrypts and extracts one firmware download into a directory.
pub struct StreamingUnwrapPipeline {
    output_dir: PathBuf,
    cipher: FirmwareCipher,
    byte_size: u64,
}

impl StreamingUnwrapPipeline {
    /// `byte_size` is the length of the encrypted stream.
    pub fn new(output_dir: &Path, key: &FirmwareKey, byte_size: u64) -> Self {
        Self {
            output_dir: output_dir.to_owned(),
            cipher: FirmwareCipher::new(key),
            byte_size,
        }
    }

    /// Consume `stream` until `byte_size` bytes have been received. Progress
    /// is reported to `tracker` in encrypted bytes.
    pub async fn run<St, E>(
        self,
        stream: St,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<UnwrapSummary, UnwrapError>
    where
        St: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let output_dir = self.output_dir.clone();
        let reader = DecryptingReader::new(ChannelReader::new(rx), self.cipher.clone());
        let extractor = task::spawn_blocking(move || extract_entries(reader, &output_dir));

        let ingested = self.ingest(stream, tx, tracker, cancel).await;
        let extracted = extractor.await
            .map_err(|e| UnwrapError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        match ingested {
            Ok(received) => {
                let entries = extracted?;
                debug!("Extracted {} entries from {received} bytes", entries.len());

                Ok(UnwrapSummary {
                    entries,
                    bytes_received: received,
                })
            }
            Err(IngestError::Cancelled) => Err(UnwrapError::Cancelled),
            Err(IngestError::Short { received, cause }) => Err(UnwrapError::IncompleteDownload {
                received,
                expected: self.byte_size,
                cause,
            }),
            Err(IngestError::Overrun(received)) => Err(UnwrapError::CorruptArchive(format!(
                "Received {received} bytes, but only {} were expected", self.byte_size))),
            Err(IngestError::ExtractorStopped) => match extracted {
                Err(e) => Err(e),
                Ok(_) => Err(UnwrapError::CorruptArchive(
                    "Extraction stopped before the download finished".to_owned())),
            },
        }
    }

    /// Forward chunks to the extract stage. The sender is dropped on return,
    /// which signals the end of the data.
    async fn ingest<St, E>(
        &self,
        stream: St,
        tx: mpsc::Sender<Bytes>,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<u64, IngestError>
    where
        St: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        tokio::pin!(stream);
        let mut received = 0u64;

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                item = stream.next() => item,
            };

            let chunk = match item {
                None => break,
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    warn!("Download stream failed after {received} bytes: {e}");
                    return Err(IngestError::Short {
                        received,
                        cause: e.to_string(),
                    });
                }
            };
            trace!("Received {} bytes", chunk.len());

            received += chunk.len() as u64;
            if received > self.byte_size {
                return Err(IngestError::Overrun(received));
            }
            tracker.advance(chunk.len() as u64);

            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                r = tx.send(chunk) => if r.is_err() {
                    debug!("Extractor stopped after {received} bytes");
                    return Err(IngestError::ExtractorStopped);
                },
            }
        }

        if received < self.byte_size {
            return Err(IngestError::Short {
                received,
                cause: "Stream ended early".to_owned(),
            });
        }

        tracker.finish();

        Ok(received)
    }
}

fn corrupt(e: impl fmt::Display) -> UnwrapError {
    UnwrapError::CorruptArchive(e.to_string())
}

/// Extract entries in archive order. Entries stay under their part paths
/// until every entry was read, its checksum matched and the central directory
/// agrees with the local headers. Only then are all of them committed.
fn extract_entries<R: Read>(reader: R, output_dir: &Path) -> Result<Vec<PathBuf>, UnwrapError> {
    let mut reader = CountingReader::new(reader);
    let mut local = BTreeMap::new();
    let mut pending = vec![];
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    let directory_offset = loop {
        let offset = reader.count;

        let mut entry = match zip::read::read_zipfile_from_stream(&mut reader) {
            Ok(Some(e)) => e,
            Ok(None) => break offset,
            Err(e) => return Err(corrupt(e)),
        };

        let name = entry.name().to_owned();
        let rel_path = entry.enclosed_name()
            .ok_or_else(|| UnwrapError::CorruptArchive(format!("Unsafe entry path: {name:?}")))?
            .to_owned();
        let path = output_dir.join(&rel_path);

        let record = EntryRecord {
            name: entry.name_raw().to_vec(),
            crc32: entry.crc32(),
            compressed_size: entry.compressed_size(),
            size: entry.size(),
        };
        if local.values().any(|r: &EntryRecord| r.name == record.name) {
            return Err(UnwrapError::CorruptArchive(format!("Duplicate entry: {name:?}")));
        }
        local.insert(offset, record);

        if entry.is_dir() {
            debug!("Creating directory: {path:?}");
            fs::create_dir_all(&path)?;
            continue;
        }

        debug!("Extracting {name:?} ({} bytes)", entry.size());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = PartFile::create(&path)?;

        loop {
            let n = entry.read(&mut buf).map_err(|e| UnwrapError::CorruptArchive(
                format!("Failed to read entry {name:?}: {e}")))?;
            if n == 0 {
                break;
            }

            file.write_all(&buf[..n])?;
        }

        file.flush()?;
        pending.push((file, rel_path));
    };

    // The stream reader already consumed the first directory header's
    // signature
    let mut directory = central::CENTRAL_HEADER_MAGIC.to_vec();
    let n = (&mut reader).take(MAX_DIRECTORY_SIZE + 1).read_to_end(&mut directory).map_err(corrupt)?;
    if n as u64 > MAX_DIRECTORY_SIZE {
        return Err(UnwrapError::CorruptArchive(format!(
            "Central directory exceeds {MAX_DIRECTORY_SIZE} bytes")));
    }
    trace!("Central directory at {directory_offset}: {} bytes", directory.len());

    central::verify(&directory, directory_offset, &local, FirmwareCipher::block_size() - 1)
        .map_err(corrupt)?;

    commit_all(pending)
}

/// Move every part file into place. If one fails, the ones already moved are
/// put back so that no entry looks complete.
fn commit_all(pending: Vec<(PartFile, PathBuf)>) -> Result<Vec<PathBuf>, UnwrapError> {
    let mut committed = vec![];
    let mut entries = vec![];

    for (file, rel_path) in pending {
        match file.commit() {
            Ok(path) => {
                committed.push(path);
                entries.push(rel_path);
            }
            Err(e) => {
                for path in committed {
                    if let Err(e) = fs::rename(&path, file::part_path(&path)) {
                        warn!("Could not roll back {path:?}: {e}");
                    }
                }

                return Err(e.into());
            }
        }
    }

    Ok(entries)
}

/// Counts the bytes read through it.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Blocking reader over the chunks sent by the ingest stage. A closed channel
/// is the end of the stream.
struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }

        let n = cmp::min(buf.len(), self.current.len());
        let chunk = self.current.split_to(n);
        buf[..n].copy_from_slice(&chunk);

        Ok(n)
    }
}

/// Decrypts whole cipher blocks as they become available. Bytes that do not
/// yet form a whole block are carried over to the next read.
struct DecryptingReader<R> {
    inner: R,
    cipher: FirmwareCipher,
    buf: Vec<u8>,
    /// Start of the decrypted bytes not yet returned
    pos: usize,
    /// End of the decrypted bytes. Anything after is ciphertext
    ready: usize,
    /// Set once the inner reader is exhausted or failed. Later reads return EOF
    done: bool,
}

impl<R: Read> DecryptingReader<R> {
    fn new(inner: R, cipher: FirmwareCipher) -> Self {
        Self {
            inner,
            cipher,
            buf: Vec::with_capacity(DECRYPT_BUF_SIZE + FirmwareCipher::block_size()),
            pos: 0,
            ready: 0,
            done: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        self.buf.drain(..self.ready);
        self.pos = 0;
        self.ready = 0;

        let carry = self.buf.len();
        self.buf.resize(carry + DECRYPT_BUF_SIZE, 0);

        let n = match self.inner.read(&mut self.buf[carry..]) {
            Ok(n) => n,
            Err(e) => {
                self.buf.truncate(carry);
                self.done = true;
                return Err(e);
            }
        };
        self.buf.truncate(carry + n);

        if n == 0 {
            self.done = true;

            if !self.buf.is_empty() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, format!(
                    "Stream ends with {} bytes that do not form a whole block", self.buf.len())));
            }

            return Ok(());
        }

        let aligned = self.buf.len() / FirmwareCipher::block_size() * FirmwareCipher::block_size();
        self.cipher.decrypt_in_place(&mut self.buf[..aligned])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.ready = aligned;

        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos == self.ready {
            if self.done {
                return Ok(0);
            }
            self.fill()?;
        }

        let n = cmp::min(buf.len(), self.ready - self.pos);
        buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;

        Ok(n)
    }
}
