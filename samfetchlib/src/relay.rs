//! Re-upload a local file to an anonymous file host.

use std::{
    io,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_util::Stream;
use log::{debug, info, warn};
use reqwest::{
    multipart::{Form, Part},
    Body,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

use progresslib::{ProgressSender, ProgressTracker};

pub const GOFILE_API_URL: &str = "https://api.gofile.io";
pub const GOFILE_UPLOAD_URL: &str = "https://{server}.gofile.io/uploadFile";

/// Used when the best server can't be looked up
const DEFAULT_SERVER: &str = "store1";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Default interval between progress reports
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Upload was rejected: {0}")]
    UploadRejected(String),
    #[error("Upload failed: {0}")]
    UploadTransportError(#[source] reqwest::Error),
    #[error("Could not read upload source: {0}")]
    Io(#[from] io::Error),
}

/// Where the file host lives.
#[derive(Clone, Debug)]
pub struct RelayEndpoints {
    pub api_base: String,
    /// Upload URL with a `{server}` placeholder
    pub upload_url_template: String,
}

impl Default for RelayEndpoints {
    fn default() -> Self {
        Self {
            api_base: GOFILE_API_URL.to_owned(),
            upload_url_template: GOFILE_UPLOAD_URL.to_owned(),
        }
    }
}

/// A successfully relayed file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadResult {
    pub download_page: String,
    /// Only provided for some accounts
    pub direct_link: Option<String>,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// Time spent uploading
    pub upload_time: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ServerData {
    server: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadData {
    download_page: String,
    direct_link: Option<String>,
    file_id: String,
    file_name: Option<String>,
}

pub struct MirrorRelay {
    client: reqwest::Client,
    endpoints: RelayEndpoints,
    progress: ProgressSender,
    interval: Duration,
}

impl MirrorRelay {
    pub fn new(client: reqwest::Client, endpoints: RelayEndpoints, progress: ProgressSender) -> Self {
        Self {
            client,
            endpoints,
            progress,
            interval: PROGRESS_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Ask the host which server to upload to. Any failure falls back to
    /// [`DEFAULT_SERVER`].
    pub async fn best_server(&self) -> String {
        let url = format!("{}/getServer", self.endpoints.api_base);
        debug!("Looking up best server: {url}");

        let lookup = async {
            let r = self.client.get(&url)
                .timeout(LOOKUP_TIMEOUT)
                .send()
                .await?
                .error_for_status()?;
            let data = r.bytes().await?;

            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(
                serde_json::from_slice::<ApiResponse<ServerData>>(&data)?)
        };

        match lookup.await {
            Ok(ApiResponse { status, data: Some(d) }) if status == "ok" && !d.server.is_empty() => {
                debug!("Best server: {}", d.server);
                d.server
            }
            Ok(r) => {
                warn!("Unusable server lookup response ({}), using {DEFAULT_SERVER}", r.status);
                DEFAULT_SERVER.to_owned()
            }
            Err(e) => {
                warn!("Server lookup failed ({e}), using {DEFAULT_SERVER}");
                DEFAULT_SERVER.to_owned()
            }
        }
    }

    /// Stream `path` to the host as a multipart upload.
    pub async fn upload(&self, path: &Path) -> Result<UploadResult, RelayError> {
        let file_name = path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("firmware.zip")
            .to_owned();

        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();

        let server = self.best_server().await;
        let url = self.endpoints.upload_url_template.replace("{server}", &server);
        info!("Uploading {file_name:?} ({file_size} bytes) to {url}");

        let tracker = self.progress.tracker("upload", Some(file_size), self.interval);
        let body = Body::wrap_stream(ProgressStream::new(ReaderStream::new(file), tracker));
        let part = Part::stream_with_length(body, file_size)
            .file_name(file_name.clone());
        let form = Form::new().part("file", part);

        let started = Instant::now();
        let r = self.client.post(&url)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(RelayError::UploadTransportError)?;
        let status = r.status();
        let data = r.bytes().await.map_err(RelayError::UploadTransportError)?;
        let upload_time = started.elapsed();

        debug!("Upload response ({status}): {:?}", String::from_utf8_lossy(&data));

        if !status.is_success() {
            return Err(RelayError::UploadRejected(format!("HTTP {status}")));
        }

        let response: ApiResponse<UploadData> = serde_json::from_slice(&data)
            .map_err(|e| RelayError::UploadRejected(format!("Invalid response: {e}")))?;
        let upload = match response {
            ApiResponse { status, data: Some(d) } if status == "ok" => d,
            ApiResponse { status, .. } => return Err(RelayError::UploadRejected(status)),
        };

        Ok(UploadResult {
            download_page: upload.download_page,
            direct_link: upload.direct_link,
            file_id: upload.file_id,
            file_name: upload.file_name.unwrap_or(file_name),
            file_size,
            upload_time,
        })
    }
}

/// Passes chunks through while counting them. The final report is sent when
/// the inner stream ends.
struct ProgressStream<S> {
    inner: S,
    tracker: ProgressTracker,
    finished: bool,
}

impl<S> ProgressStream<S> {
    fn new(inner: S, tracker: ProgressTracker) -> Self {
        Self {
            inner,
            tracker,
            finished: false,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(item) => item,
            Poll::Pending => return Poll::Pending,
        };

        match &item {
            Some(Ok(chunk)) => {
                self.tracker.advance(chunk.len() as u64);
            }
            None if !self.finished => {
                self.finished = true;
                self.tracker.finish();
            }
            _ => {}
        }

        Poll::Ready(item)
    }
}
