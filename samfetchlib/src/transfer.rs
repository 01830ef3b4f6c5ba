//! Plain download of a file to disk, used for mirrored firmware that needs no
//! decryption.

use std::{
    io,
    path::Path,
    time::Duration,
};

use log::{debug, trace};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use progresslib::ProgressTracker;

use crate::file;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP request error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Download incomplete after {received} of {expected} bytes")]
    IncompleteDownload {
        received: u64,
        expected: u64,
    },
    #[error("Received {received} bytes, but only {expected} were expected")]
    SizeMismatch {
        received: u64,
        expected: u64,
    },
    #[error("Download was cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Download `url` to `path`. The data goes to the part file first and is only
/// moved to `path` once the size matches `expected`, or the response's
/// `Content-Length` if `expected` is `None`. Returns the number of bytes
/// written.
pub async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    expected: Option<u64>,
    tracker: &mut ProgressTracker,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    debug!("Downloading {url} to {path:?}");

    let r = tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        r = client.get(url).timeout(TRANSFER_TIMEOUT).send() => r?,
    };
    r.error_for_status_ref()?;

    let expected = expected.or_else(|| r.content_length());
    tracker.set_length(expected);

    let part_path = file::part_path(path);
    let mut writer = BufWriter::new(File::create(&part_path).await?);
    let stream = r.bytes_stream();
    tokio::pin!(stream);
    let mut received = 0u64;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            c = stream.next() => match c {
                Some(c) => c?,
                None => break,
            },
        };
        trace!("Received {} bytes", chunk.len());

        received += chunk.len() as u64;
        if let Some(e) = expected {
            if received > e {
                // Not the file that was probed
                drop(writer);
                file::delete_if_exists(&part_path)?;

                return Err(TransferError::SizeMismatch {
                    received,
                    expected: e,
                });
            }
        }

        writer.write_all(&chunk).await?;
        tracker.advance(chunk.len() as u64);
    }

    writer.flush().await?;
    drop(writer);

    if let Some(e) = expected {
        if received < e {
            return Err(TransferError::IncompleteDownload {
                received,
                expected: e,
            });
        }
    }

    fs::rename(&part_path, path).await?;
    tracker.finish();

    Ok(received)
}
