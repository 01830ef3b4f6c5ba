//! Runs one acquisition from start to finish along the path chosen by the
//! caller. There is no fallback from one path to the other.

use std::{
    fmt,
    future::Future,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use progresslib::{ProgressSender, ProgressTracker};

use crate::{
    auth::Signer,
    crypto::CryptoError,
    fus::{BinaryMetadata, FusEndpoints, FusError, SessionClient},
    manifest::{FOTA_BASE_URL, ResolveError, VersionResolver},
    probe::{DirectAcquisitionProbe, ProbeError, ProbeTable, Prober},
    relay::{MirrorRelay, RelayEndpoints, RelayError, UploadResult},
    rewrite::{ModelRewriter, Rewrite},
    transfer::{self, TransferError},
    unwrap::{StreamingUnwrapPipeline, UnwrapError},
    version::VersionTriple,
};

/// Name of the summary written next to a relayed file
pub const UPLOAD_INFO_FILE: &str = "upload_info.txt";

const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Failure categories a caller can act on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    ManifestUnavailable,
    NoVersionPublished,
    AuthHandshakeFailed,
    BinaryNotFound,
    MalformedLogicValue,
    IncompleteDownload,
    CorruptArchive,
    NoMirrorFound,
    UploadRejected,
    UploadTransportError,
    /// Local filesystem failure
    Io,
    /// Aborted by the caller
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Fus(#[from] FusError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Unwrap(#[from] UnwrapError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("Acquisition was cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolve(ResolveError::ManifestUnavailable(_)) => ErrorKind::ManifestUnavailable,
            Self::Resolve(ResolveError::NoVersionPublished { .. }) => ErrorKind::NoVersionPublished,
            Self::Fus(FusError::BinaryNotFound(_) | FusError::FusBadField(..)) => ErrorKind::BinaryNotFound,
            Self::Fus(_) => ErrorKind::AuthHandshakeFailed,
            Self::Crypto(CryptoError::MalformedLogicValue(_)) => ErrorKind::MalformedLogicValue,
            Self::Crypto(_) => ErrorKind::AuthHandshakeFailed,
            Self::Unwrap(UnwrapError::IncompleteDownload { .. }) => ErrorKind::IncompleteDownload,
            Self::Unwrap(UnwrapError::CorruptArchive(_)) => ErrorKind::CorruptArchive,
            Self::Unwrap(UnwrapError::Cancelled) => ErrorKind::Cancelled,
            Self::Unwrap(UnwrapError::Io(_)) => ErrorKind::Io,
            Self::Probe(ProbeError::NoMirrorFound(_)) => ErrorKind::NoMirrorFound,
            Self::Probe(ProbeError::Cancelled) => ErrorKind::Cancelled,
            Self::Transfer(TransferError::Cancelled) => ErrorKind::Cancelled,
            Self::Transfer(TransferError::Io(_)) => ErrorKind::Io,
            Self::Transfer(_) => ErrorKind::IncompleteDownload,
            Self::Relay(RelayError::UploadRejected(_)) => ErrorKind::UploadRejected,
            Self::Relay(RelayError::UploadTransportError(_)) => ErrorKind::UploadTransportError,
            Self::Relay(RelayError::Io(_)) => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Terminal failure of an acquisition.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AcquireFailure {
    #[source]
    pub error: AcquireError,
    /// Last known number of bytes downloaded
    pub bytes_transferred: u64,
}

impl AcquireFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// How to acquire the firmware.
pub enum AcquirePath<S> {
    /// Through the distribution service, which needs a signer
    Authenticated(S),
    /// From a public mirror, then relayed to a file host
    Bypass,
}

/// What to acquire and where to put it.
#[derive(Clone, Debug)]
pub struct AcquireRequest {
    pub model: String,
    pub region: String,
    /// Parent of the per-model output directory
    pub output_dir: PathBuf,
}

/// Result of a successful acquisition.
#[derive(Clone, Debug)]
pub enum Outcome {
    Extracted {
        model: Rewrite,
        version: VersionTriple,
        metadata: BinaryMetadata,
        output_dir: PathBuf,
        /// Relative to `output_dir`
        entries: Vec<PathBuf>,
        bytes_transferred: u64,
    },
    Mirrored {
        model: Rewrite,
        version: VersionTriple,
        source_url: String,
        local_file: PathBuf,
        upload: UploadResult,
        summary_file: PathBuf,
        bytes_transferred: u64,
    },
}

/// Base URLs of every remote service.
#[derive(Clone, Debug)]
pub struct Endpoints {
    pub manifest_base: String,
    pub fus: FusEndpoints,
    pub relay: RelayEndpoints,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            manifest_base: FOTA_BASE_URL.to_owned(),
            fus: FusEndpoints::default(),
            relay: RelayEndpoints::default(),
        }
    }
}

pub struct AcquisitionOrchestrator<P> {
    client: reqwest::Client,
    prober: P,
    rewriter: ModelRewriter,
    probe_table: ProbeTable,
    endpoints: Endpoints,
    progress: ProgressSender,
    progress_interval: Duration,
}

impl<P: Prober> AcquisitionOrchestrator<P> {
    pub fn new(client: reqwest::Client, prober: P) -> Self {
        Self {
            client,
            prober,
            rewriter: ModelRewriter::new(),
            probe_table: ProbeTable::default(),
            endpoints: Endpoints::default(),
            progress: ProgressSender::disabled(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_rewriter(mut self, rewriter: ModelRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_probe_table(mut self, table: ProbeTable) -> Self {
        self.probe_table = table;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Publish download and upload progress to `progress`, at most once per
    /// `interval` per transfer.
    pub fn with_progress(mut self, progress: ProgressSender, interval: Duration) -> Self {
        self.progress = progress;
        self.progress_interval = interval;
        self
    }

    /// Run one acquisition along `path`.
    pub async fn acquire<S: Signer>(
        &self,
        request: &AcquireRequest,
        path: AcquirePath<S>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, AcquireFailure> {
        let mut tracker = self.progress.tracker("download", None, self.progress_interval);

        let result = match path {
            AcquirePath::Authenticated(signer) => {
                self.authenticated(request, signer, &mut tracker, cancel).await
            }
            AcquirePath::Bypass => self.bypass(request, &mut tracker, cancel).await,
        };

        result.map_err(|error| {
            debug!("Acquisition failed: {error:?}");

            AcquireFailure {
                error,
                bytes_transferred: tracker.position(),
            }
        })
    }

    /// Rewrite the model and look up its latest version.
    async fn resolve(
        &self,
        request: &AcquireRequest,
        cancel: &CancellationToken,
    ) -> Result<(Rewrite, VersionTriple), AcquireError> {
        let model = self.rewriter.rewrite(&request.model);
        let resolver = VersionResolver::with_base_url(self.client.clone(), &self.endpoints.manifest_base);

        let version = cancellable(cancel, resolver.resolve(&request.region, &model.transformed)).await??;
        info!("Latest version of {} in {}: {version}", model.transformed, request.region);

        Ok((model, version))
    }

    async fn authenticated<S: Signer>(
        &self,
        request: &AcquireRequest,
        signer: S,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Outcome, AcquireError> {
        let (model, version) = self.resolve(request, cancel).await?;

        let session = SessionClient::with_endpoints(self.client.clone(), signer, self.endpoints.fus.clone());
        let issued = cancellable(cancel, session.issue_nonce()).await??;
        let informed = cancellable(cancel, issued.binary_inform(
            &model.transformed, &request.region, &version)).await??;

        // Derive before starting the download so a bad logic value fails fast
        let key = informed.metadata().decryption_key()?;
        let activated = cancellable(cancel, informed.binary_init()).await??;
        let byte_size = activated.metadata().byte_size;

        let (metadata, response) = cancellable(cancel, activated.download()).await?
            .map_err(|e| match e {
                FusError::RequestError(e) => AcquireError::Unwrap(UnwrapError::IncompleteDownload {
                    received: 0,
                    expected: byte_size,
                    cause: e.to_string(),
                }),
                e => e.into(),
            })?;

        let output_dir = output_dir(request, &model);
        fs::create_dir_all(&output_dir).await?;

        info!("Extracting {} ({} bytes) to {output_dir:?}", metadata.filename, metadata.byte_size);

        tracker.set_label(&metadata.filename);
        tracker.set_length(Some(metadata.byte_size));

        let summary = StreamingUnwrapPipeline::new(&output_dir, &key, metadata.byte_size)
            .run(response.bytes_stream(), tracker, cancel)
            .await?;

        Ok(Outcome::Extracted {
            model,
            version,
            metadata,
            output_dir,
            entries: summary.entries,
            bytes_transferred: summary.bytes_received,
        })
    }

    async fn bypass(
        &self,
        request: &AcquireRequest,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Outcome, AcquireError> {
        let (model, version) = self.resolve(request, cancel).await?;

        let probe = DirectAcquisitionProbe::new(&self.prober, self.probe_table.clone());
        let hit = probe.find(&model.transformed, &request.region, &version, cancel).await?;

        let output_dir = output_dir(request, &model);
        fs::create_dir_all(&output_dir).await?;

        let file_name = url_file_name(&hit.url)
            .unwrap_or_else(|| format!("{}_{}.zip", sanitize(&model.transformed), request.region));
        let local_file = output_dir.join(file_name);

        tracker.set_label(&hit.url);
        let bytes_transferred = transfer::download_to_file(
            &self.client, &hit.url, &local_file, Some(hit.size), tracker, cancel).await?;

        let relay = MirrorRelay::new(self.client.clone(), self.endpoints.relay.clone(), self.progress.clone())
            .with_interval(self.progress_interval);
        let upload = cancellable(cancel, relay.upload(&local_file)).await??;

        info!("Uploaded to {}", upload.download_page);

        let summary_file = output_dir.join(UPLOAD_INFO_FILE);
        fs::write(&summary_file, upload_summary(&model, &request.region, &version, &hit.url, &upload)).await?;

        Ok(Outcome::Mirrored {
            model,
            version,
            source_url: hit.url,
            local_file,
            upload,
            summary_file,
            bytes_transferred,
        })
    }
}

/// Await `future` unless `cancel` fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output, AcquireError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcquireError::Cancelled),
        r = future => Ok(r),
    }
}

/// Make a string usable as a single path component.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

/// `<output>/<model as given>_<region>`
fn output_dir(request: &AcquireRequest, model: &Rewrite) -> PathBuf {
    request.output_dir.join(format!("{}_{}", sanitize(model.original.trim()), sanitize(&request.region)))
}

/// Last path segment of a URL, without the query.
fn url_file_name(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;

    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    Path::new(name).file_name()
        .and_then(|n| n.to_str())
        .map(sanitize)
}

fn upload_summary(
    model: &Rewrite,
    region: &str,
    version: &VersionTriple,
    source_url: &str,
    upload: &UploadResult,
) -> String {
    let mut s = String::new();

    s.push_str(&format!("Model: {}\n", model.original));
    if model.changed {
        s.push_str(&format!("Resolved model: {}\n", model.transformed));
    }
    s.push_str(&format!("Region: {region}\n"));
    s.push_str(&format!("Version: {version}\n"));
    s.push_str(&format!("Source: {source_url}\n"));
    s.push_str(&format!("File: {}\n", upload.file_name));
    s.push_str(&format!("Size: {} bytes\n", upload.file_size));
    s.push_str(&format!("Download page: {}\n", upload.download_page));
    if let Some(link) = &upload.direct_link {
        s.push_str(&format!("Direct link: {link}\n"));
    }
    s.push_str(&format!("File ID: {}\n", upload.file_id));
    s.push_str(&format!("Upload time: {:.1}s\n", upload.upload_time.as_secs_f64()));

    s
}

#[cfg(test)]
mod tests {
    use std::fs as std_fs;

    use assert_matches::assert_matches;
    use futures_util::future::BoxFuture;
    use httpmock::prelude::*;

    use super::*;
    use crate::{
        auth::{FusSigner, Nonce},
        crypto::{self, FusKeys},
        probe::ProbeResponse,
        unwrap::fixtures,
    };

    const MANIFEST: &str = "<versioninfo><firmware><version>\
        <latest o=\"11\">F916NTBU1ATJC/F916NOKT1ATJC/F916NKSU1ATJ7</latest>\
        </version></firmware></versioninfo>";
    const FW_VERSION: &str = "F916NTBU1ATJC/F916NOKT1ATJC/F916NKSU1ATJ7/F916NTBU1ATJC";
    const LOGIC_VALUE: &str = "gvkq0ijeh31ydaxp";
    const BINARY_NAME: &str = "SM-F916N_10_20201028094404_saezf08xjk_fac.zip.enc4";

    /// Prober that finds exactly one URL.
    struct OneHit {
        url: String,
        size: u64,
    }

    impl Prober for OneHit {
        fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProbeResponse> {
            Box::pin(async move {
                if url == self.url {
                    ProbeResponse { accessible: true, size: Some(self.size) }
                } else {
                    ProbeResponse::default()
                }
            })
        }
    }

    fn signer() -> FusSigner {
        FusSigner::new(FusKeys::new(
            b"testing_testing_testing_testing_",
            b"testing_testing_",
        ).unwrap())
    }

    fn endpoints(server: &MockServer) -> Endpoints {
        Endpoints {
            manifest_base: server.base_url(),
            fus: FusEndpoints {
                fus_base: server.base_url(),
                download_base: server.base_url(),
            },
            relay: RelayEndpoints {
                api_base: server.base_url(),
                upload_url_template: format!("{}/{{server}}/uploadFile", server.base_url()),
            },
        }
    }

    fn probe_table(server: &MockServer) -> ProbeTable {
        ProbeTable {
            hosts: vec![server.base_url()],
            paths: vec!["/mirror/{region}/".to_owned(), "/files/".to_owned()],
            filenames: vec!["{model}_{pda}.zip".to_owned(), "{pda}_{csc}_{modem}.zip".to_owned()],
            batch_size: 3,
            batch_delay_ms: 10,
        }
    }

    fn request(dir: &Path) -> AcquireRequest {
        AcquireRequest {
            model: "SM-F916N".to_owned(),
            region: "KOO".to_owned(),
            output_dir: dir.to_owned(),
        }
    }

    async fn mock_manifest(server: &MockServer) {
        server.mock_async(|when, then| {
            when.method(GET).path("/firmware/KOO/SM-F916N/version.xml");
            then.status(200).body(MANIFEST);
        }).await;
    }

    fn inform_response(byte_size: usize) -> String {
        let field = |name: &str, value: &str| format!("<{name}><Data>{value}</Data></{name}>");

        format!(
            "<FUSMsg><FUSBody><Results><Status>200</Status></Results><Put>{}{}{}{}{}</Put></FUSBody></FUSMsg>",
            field("BINARY_NAME", BINARY_NAME),
            field("BINARY_BYTE_SIZE", &byte_size.to_string()),
            field("MODEL_PATH", "/neofus/9/"),
            field("LATEST_FW_VERSION", FW_VERSION),
            field("LOGIC_VALUE_FACTORY", LOGIC_VALUE),
        )
    }

    #[tokio::test]
    async fn test_authenticated() {
        let server = MockServer::start_async().await;
        let signer = signer();

        let (archive, files) = fixtures::build_archive();
        let key = crypto::derive_key(FW_VERSION, LOGIC_VALUE).unwrap();
        let ciphertext = fixtures::encrypt(&key, archive);

        let nonce_1 = signer.encrypt_nonce(&Nonce::from_slice(b"0123456789ABCDEF").unwrap());
        let nonce_2 = signer.encrypt_nonce(&Nonce::from_slice(b"FEDCBA9876543210").unwrap());

        mock_manifest(&server).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/NF_DownloadGenerateNonce.do");
            then.status(200)
                .header("NONCE", &nonce_1)
                .header("Set-Cookie", "JSESSIONID=abc123; Path=/");
        }).await;
        server.mock_async(|when, then| {
            when.method(POST)
                .path("/NF_DownloadBinaryInform.do")
                .header("cookie", "JSESSIONID=abc123")
                .body_contains("<DEVICE_MODEL_NAME><Data>SM-F916N</Data>");
            then.status(200)
                .header("NONCE", &nonce_2)
                .body(inform_response(ciphertext.len()));
        }).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/NF_DownloadBinaryInitForMass.do");
            then.status(200)
                .body("<FUSMsg><FUSBody><Results><Status>200</Status></Results></FUSBody></FUSMsg>");
        }).await;
        let download_mock = server.mock_async(|when, then| {
            when.method(GET)
                .path("/NF_DownloadBinaryForMass.do")
                .query_param("file", format!("/neofus/9/{BINARY_NAME}"))
                .header_exists("authorization");
            then.status(200).body(&ciphertext);
        }).await;
        let relay_mock = server.mock_async(|when, then| {
            when.path_contains("uploadFile");
            then.status(200);
        }).await;

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(reqwest::Client::new(), OneHit {
            url: String::new(),
            size: 0,
        }).with_endpoints(endpoints(&server));

        let outcome = orchestrator
            .acquire(&request(dir.path()), AcquirePath::Authenticated(signer), &CancellationToken::new())
            .await
            .unwrap();

        let Outcome::Extracted { version, metadata, output_dir, entries, bytes_transferred, .. } = outcome else {
            panic!("Unexpected outcome: {outcome:?}");
        };

        assert_eq!(version, VersionTriple::new("F916NTBU1ATJC", "F916NOKT1ATJC", "F916NKSU1ATJ7"));
        assert_eq!(metadata.filename, BINARY_NAME);
        assert_eq!(metadata.byte_size, ciphertext.len() as u64);
        assert_eq!(bytes_transferred, ciphertext.len() as u64);
        assert_eq!(output_dir, dir.path().join("SM-F916N_KOO"));
        assert_eq!(entries.len(), 2);

        for (name, data) in files {
            assert_eq!(std_fs::read(output_dir.join(name)).unwrap(), data);
        }

        download_mock.assert_async().await;
        relay_mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_authenticated_truncated() {
        let server = MockServer::start_async().await;
        let signer = signer();

        let (archive, _) = fixtures::build_archive();
        let key = crypto::derive_key(FW_VERSION, LOGIC_VALUE).unwrap();
        let ciphertext = fixtures::encrypt(&key, archive);
        let nonce = signer.encrypt_nonce(&Nonce::from_slice(b"0123456789ABCDEF").unwrap());

        mock_manifest(&server).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/NF_DownloadGenerateNonce.do");
            then.status(200).header("NONCE", &nonce);
        }).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/NF_DownloadBinaryInform.do");
            // Server claims more than it sends
            then.status(200).body(inform_response(ciphertext.len() + 4096));
        }).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/NF_DownloadBinaryInitForMass.do");
            then.status(200)
                .body("<FUSMsg><FUSBody><Results><Status>200</Status></Results></FUSBody></FUSMsg>");
        }).await;
        server.mock_async(|when, then| {
            when.method(GET).path("/NF_DownloadBinaryForMass.do");
            then.status(200).body(&ciphertext);
        }).await;

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(reqwest::Client::new(), OneHit {
            url: String::new(),
            size: 0,
        }).with_endpoints(endpoints(&server));

        let failure = orchestrator
            .acquire(&request(dir.path()), AcquirePath::Authenticated(signer), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::IncompleteDownload);
        assert_eq!(failure.bytes_transferred, ciphertext.len() as u64);
    }

    #[tokio::test]
    async fn test_authenticated_download_refused() {
        let server = MockServer::start_async().await;
        let signer = signer();
        let nonce = signer.encrypt_nonce(&Nonce::from_slice(b"0123456789ABCDEF").unwrap());

        mock_manifest(&server).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/NF_DownloadGenerateNonce.do");
            then.status(200).header("NONCE", &nonce);
        }).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/NF_DownloadBinaryInform.do");
            then.status(200).body(inform_response(123_456));
        }).await;
        server.mock_async(|when, then| {
            when.method(POST).path("/NF_DownloadBinaryInitForMass.do");
            then.status(200)
                .body("<FUSMsg><FUSBody><Results><Status>200</Status></Results></FUSBody></FUSMsg>");
        }).await;
        server.mock_async(|when, then| {
            when.method(GET).path("/NF_DownloadBinaryForMass.do");
            then.status(503);
        }).await;

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(reqwest::Client::new(), OneHit {
            url: String::new(),
            size: 0,
        }).with_endpoints(endpoints(&server));

        let failure = orchestrator
            .acquire(&request(dir.path()), AcquirePath::Authenticated(signer), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::IncompleteDownload);
        assert_eq!(failure.bytes_transferred, 0);
        assert_matches!(failure.error, AcquireError::Unwrap(UnwrapError::IncompleteDownload {
            received: 0,
            expected: 123_456,
            ..
        }));
    }

    #[tokio::test]
    async fn test_bypass_no_mirror() {
        let server = MockServer::start_async().await;
        mock_manifest(&server).await;
        let server_mock = server.mock_async(|when, then| {
            when.method(GET).path("/getServer");
            then.status(200).body(r#"{"status":"ok","data":{"server":"store7"}}"#);
        }).await;
        let upload_mock = server.mock_async(|when, then| {
            when.method(POST).path_contains("uploadFile");
            then.status(200);
        }).await;

        let dir = tempfile::tempdir().unwrap();
        // Every probe gets a 404 from the mock server
        let orchestrator = AcquisitionOrchestrator::new(
            reqwest::Client::new(),
            crate::probe::HttpProber::new(reqwest::Client::new()),
        )
            .with_endpoints(endpoints(&server))
            .with_probe_table(probe_table(&server));

        let failure = orchestrator
            .acquire(&request(dir.path()), AcquirePath::<FusSigner>::Bypass, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::NoMirrorFound);
        assert_eq!(failure.bytes_transferred, 0);
        server_mock.assert_hits_async(0).await;
        upload_mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_bypass() {
        let server = MockServer::start_async().await;
        let firmware = fixtures::payload(1_200_000, 3);

        mock_manifest(&server).await;
        server.mock_async(|when, then| {
            when.method(GET).path("/files/F916NTBU1ATJC_F916NOKT1ATJC_F916NKSU1ATJ7.zip");
            then.status(200).body(&firmware);
        }).await;
        server.mock_async(|when, then| {
            when.method(GET).path("/getServer");
            then.status(200).body(r#"{"status":"ok","data":{"server":"store7"}}"#);
        }).await;
        let upload_mock = server.mock_async(|when, then| {
            when.method(POST).path("/store7/uploadFile");
            then.status(200).body(r#"{"status":"ok","data":{
                "downloadPage":"https://gofile.io/d/Abc123",
                "fileId":"4991e6d7",
                "fileName":"F916NTBU1ATJC_F916NOKT1ATJC_F916NKSU1ATJ7.zip"}}"#);
        }).await;

        let url = server.url("/files/F916NTBU1ATJC_F916NOKT1ATJC_F916NKSU1ATJ7.zip");
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(reqwest::Client::new(), OneHit {
            url: url.clone(),
            size: firmware.len() as u64,
        })
            .with_endpoints(endpoints(&server))
            .with_probe_table(probe_table(&server));

        let outcome = orchestrator
            .acquire(&request(dir.path()), AcquirePath::<FusSigner>::Bypass, &CancellationToken::new())
            .await
            .unwrap();

        let Outcome::Mirrored { source_url, local_file, upload, summary_file, bytes_transferred, .. } = outcome else {
            panic!("Unexpected outcome: {outcome:?}");
        };

        assert_eq!(source_url, url);
        assert_eq!(bytes_transferred, firmware.len() as u64);
        assert_eq!(local_file, dir.path().join("SM-F916N_KOO/F916NTBU1ATJC_F916NOKT1ATJC_F916NKSU1ATJ7.zip"));
        assert_eq!(std_fs::read(&local_file).unwrap(), firmware);
        assert_eq!(upload.download_page, "https://gofile.io/d/Abc123");
        upload_mock.assert_async().await;

        let summary = std_fs::read_to_string(summary_file).unwrap();
        assert!(summary.contains("Download page: https://gofile.io/d/Abc123\n"));
        assert!(summary.contains("Version: F916NTBU1ATJC/F916NOKT1ATJC/F916NKSU1ATJ7\n"));
    }

    #[tokio::test]
    async fn test_manifest_failure() {
        let server = MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(GET).path("/firmware/KOO/SM-F916N/version.xml");
            then.status(403);
        }).await;

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(reqwest::Client::new(), OneHit {
            url: String::new(),
            size: 0,
        }).with_endpoints(endpoints(&server));

        let failure = orchestrator
            .acquire(&request(dir.path()), AcquirePath::Authenticated(signer()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::NoVersionPublished);
        assert!(!dir.path().join("SM-F916N_KOO").exists());
    }

    #[tokio::test]
    async fn test_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let orchestrator = AcquisitionOrchestrator::new(reqwest::Client::new(), OneHit {
            url: String::new(),
            size: 0,
        });

        let failure = orchestrator
            .acquire(&request(dir.path()), AcquirePath::<FusSigner>::Bypass, &cancel)
            .await
            .unwrap_err();

        assert_matches!(failure.error, AcquireError::Cancelled);
        assert_eq!(failure.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_error_kinds() {
        let kind = |e: AcquireError| e.kind();

        assert_eq!(kind(CryptoError::MalformedLogicValue(3).into()), ErrorKind::MalformedLogicValue);
        assert_eq!(kind(FusError::AuthHandshakeFailed("x".into()).into()), ErrorKind::AuthHandshakeFailed);
        assert_eq!(kind(FusError::FusBadField("a".into(), "b".into()).into()), ErrorKind::BinaryNotFound);
        assert_eq!(kind(UnwrapError::CorruptArchive("x".into()).into()), ErrorKind::CorruptArchive);
        assert_eq!(kind(ProbeError::NoMirrorFound(0).into()), ErrorKind::NoMirrorFound);
        assert_eq!(kind(RelayError::UploadRejected("x".into()).into()), ErrorKind::UploadRejected);
        assert_eq!(kind(TransferError::IncompleteDownload { received: 1, expected: 2 }.into()),
                   ErrorKind::IncompleteDownload);
    }

    #[test]
    fn test_paths() {
        let model = ModelRewriter::new().rewrite("SM-G998B/DS");
        let request = AcquireRequest {
            model: "SM-G998B/DS".to_owned(),
            region: "EUX".to_owned(),
            output_dir: PathBuf::from("out"),
        };
        assert_eq!(output_dir(&request, &model), Path::new("out/SM-G998B_DS_EUX"));

        assert_eq!(url_file_name("https://h/a/fw.zip?x=1").as_deref(), Some("fw.zip"));
        assert_eq!(url_file_name("https://h/a/"), None);
        assert_eq!(url_file_name("https://h/a/.."), None);
    }
}
