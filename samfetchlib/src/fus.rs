use std::time::Duration;

use log::{debug, trace};
use reqwest::{
    header::{AUTHORIZATION, CONTENT_LENGTH, COOKIE, HeaderMap, SET_COOKIE, USER_AGENT},
    RequestBuilder, Response,
};
use thiserror::Error;
use xmltree::Element;

use crate::{
    auth::{self, Authorization, Nonce, NonceError, Signer},
    crypto::{self, CryptoError, FirmwareKey},
    message::{self, to_utf8_or_error_string},
    version::VersionTriple,
};

pub const FUS_BASE_URL: &str = "https://neofussvr.sslcs.cdngc.net";
pub const DOWNLOAD_BASE_URL: &str = "http://cloud-neofussvr.sslcs.cdngc.net";

const FUS_USER_AGENT: &str = "Kies2.0_FUS";
const SESSION_COOKIE_NAME: &str = "JSESSIONID";
const NONCE_HEADER: &str = "nonce";

/// Timeout for the small XML requests
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for the whole firmware download
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum FusError {
    #[error("Authentication handshake failed: {0}")]
    AuthHandshakeFailed(String),
    #[error("Server sent an unusable nonce: {0}")]
    InvalidNonce(#[from] NonceError),
    #[error("Firmware binary not found: {0}")]
    BinaryNotFound(String),
    #[error("Received unsuccessful FUS response: {0}")]
    FusBadResponse(String),
    #[error("Could not parse the value for field '{0}': '{1}'")]
    FusBadField(String, String),
    #[error("HTTP request error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("XML parse error: {0}")]
    XmlParseError(#[from] xmltree::ParseError),
    #[error("XML error: {0}")]
    XmlError(#[from] xmltree::Error),
}

/// Base URLs of the distribution service.
#[derive(Clone, Debug)]
pub struct FusEndpoints {
    pub fus_base: String,
    pub download_base: String,
}

impl Default for FusEndpoints {
    fn default() -> Self {
        Self {
            fus_base: FUS_BASE_URL.to_owned(),
            download_base: DOWNLOAD_BASE_URL.to_owned(),
        }
    }
}

/// Authentication state of one session. It is passed by value from phase to
/// phase and replaced after every response.
#[derive(Clone, Debug)]
pub struct SessionState {
    /// Nonce exactly as the server sent it
    pub encrypted_nonce: String,
    /// `None` only before the nonce issuance response has been processed
    pub decrypted_nonce: Option<Nonce>,
    /// `Authorization` header value for the next request
    pub authorization: String,
    /// `JSESSIONID` cookie value
    pub session_cookie: Option<String>,
}

impl SessionState {
    /// State before any request: no nonce, no cookie and a placeholder
    /// authorization header.
    pub fn new() -> Self {
        Self {
            encrypted_nonce: String::new(),
            decrypted_nonce: None,
            authorization: Authorization::default().to_string(),
            session_cookie: None,
        }
    }

    /// Produce the state that follows a response. A `Set-Cookie` for the
    /// session replaces the cookie. A `NONCE` header replaces both nonce forms
    /// and re-signs the authorization header. Without a `NONCE` header, the
    /// authorization header is carried over unchanged.
    pub fn rotate<S: Signer + ?Sized>(
        self,
        signer: &S,
        headers: &HeaderMap,
    ) -> Result<Self, FusError> {
        let mut next = self;

        if let Some(cookie) = session_cookie(headers) {
            trace!("Session cookie: {cookie}");
            next.session_cookie = Some(cookie);
        }

        if let Some(value) = headers.get(NONCE_HEADER) {
            let raw = value.to_str()
                .map_err(|_| FusError::AuthHandshakeFailed("Nonce header is not ASCII".to_owned()))?;
            let rotated = signer.rotate_nonce(raw)?;
            let signature = signer.sign(&rotated.decrypted, next.session_cookie.as_deref());

            debug!("Rotated nonce: {:?}", rotated.decrypted);

            next.authorization = Authorization::with_signature(&signature).to_string();
            next.encrypted_nonce = rotated.encrypted;
            next.decrypted_nonce = Some(rotated.decrypted);
        }

        Ok(next)
    }

    fn nonce(&self) -> Result<Nonce, FusError> {
        self.decrypted_nonce
            .ok_or_else(|| FusError::AuthHandshakeFailed("No nonce has been issued".to_owned()))
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers.get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE_NAME)
        .map(|(_, value)| value.to_owned())
}

/// Description of a firmware build, as returned by the binary inform request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryMetadata {
    /// Encrypted firmware filename. Guaranteed to have no directory component
    pub filename: String,
    /// Size of the encrypted download in bytes
    pub byte_size: u64,
    /// Server-side directory of the file
    pub model_path: String,
    /// Android version name
    pub os_version: String,
    /// Full build version, used for key derivation
    pub version: String,
    /// Logic value used for key derivation
    pub logic_value: String,
    /// Release notes. May be empty
    pub description: String,
}

impl BinaryMetadata {
    fn from_response(root: &Element) -> Result<Self, FusError> {
        macro_rules! get_value {
            ($name:expr) => {
                message::fus_field(root, $name)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| FusError::BinaryNotFound(format!("Response has no {}", $name)))?
            }
        }
        macro_rules! get_string {
            ($name:expr) => {
                get_value!($name).to_string()
            }
        }
        macro_rules! get_parsed {
            ($name:expr) => {
                {
                    let value = get_value!($name);
                    value.trim().parse().map_err(|_| FusError::FusBadField(
                        $name.to_owned(), value.to_string()))?
                }
            }
        }

        let binary_name = get_string!("BINARY_NAME");
        let filename = auth::bare_filename(&binary_name)
            .ok_or_else(|| FusError::FusBadField("BINARY_NAME".to_owned(), binary_name.clone()))?
            .to_owned();

        Ok(Self {
            filename,
            byte_size: get_parsed!("BINARY_BYTE_SIZE"),
            model_path: get_string!("MODEL_PATH"),
            os_version: message::fus_field(root, "CURRENT_OS_VERSION")
                .map(|v| v.into_owned())
                .unwrap_or_default(),
            version: get_string!("LATEST_FW_VERSION"),
            logic_value: get_string!("LOGIC_VALUE_FACTORY"),
            description: message::fus_field(root, "DESCRIPTION")
                .map(|v| v.into_owned())
                .unwrap_or_default(),
        })
    }

    /// Derive the key for decrypting this build.
    pub fn decryption_key(&self) -> Result<FirmwareKey, CryptoError> {
        crypto::derive_key(&self.version, &self.logic_value)
    }

    /// The filename with the encryption extension (`.enc2`, `.enc4`) removed.
    pub fn decrypted_filename(&self) -> &str {
        match self.filename.rsplit_once('.') {
            Some((stem, ext)) if ext.starts_with("enc") => stem,
            _ => &self.filename,
        }
    }
}

/// Client for the authenticated distribution service. The phases of a session
/// are separate types, so they can only run in order: [`Self::issue_nonce`],
/// [`IssuedSession::binary_inform`], [`InformedSession::binary_init`],
/// [`ActivatedSession::download`].
pub struct SessionClient<S> {
    client: reqwest::Client,
    signer: S,
    endpoints: FusEndpoints,
}

impl<S: Signer> SessionClient<S> {
    pub fn new(client: reqwest::Client, signer: S) -> Self {
        Self::with_endpoints(client, signer, FusEndpoints::default())
    }

    pub fn with_endpoints(client: reqwest::Client, signer: S, endpoints: FusEndpoints) -> Self {
        Self {
            client,
            signer,
            endpoints,
        }
    }

    /// Send a request with the session's headers and rotate the state from
    /// the response headers. The state is rotated even if the response is an
    /// HTTP error, because the server may still hand out a new nonce.
    async fn execute(
        &self,
        state: SessionState,
        request: RequestBuilder,
        authorization: &str,
    ) -> Result<(SessionState, Response), FusError> {
        let mut request = request
            .header(AUTHORIZATION, authorization)
            .header(USER_AGENT, FUS_USER_AGENT);
        if let Some(cookie) = &state.session_cookie {
            request = request.header(COOKIE, format!("{SESSION_COOKIE_NAME}={cookie}"));
        }

        let r = request.send().await?;
        let state = state.rotate(&self.signer, r.headers())?;
        r.error_for_status_ref()?;

        Ok((state, r))
    }

    /// POST an XML message and parse the XML response.
    async fn execute_xml(
        &self,
        state: SessionState,
        endpoint: &str,
        body: &Element,
    ) -> Result<(SessionState, Element), FusError> {
        let url = format!("{}/{endpoint}", self.endpoints.fus_base);
        let buf = message::serialize(body)?;

        debug!("FUS URL: {url}");
        debug!("FUS request: {:?}", to_utf8_or_error_string(&buf));

        let authorization = state.authorization.clone();
        let request = self.client.post(&url)
            .timeout(METADATA_TIMEOUT)
            .body(buf);
        let (state, r) = self.execute(state, request, &authorization).await?;
        let data = r.bytes().await?;

        debug!("FUS response: {:?}", to_utf8_or_error_string(&data));

        Ok((state, Element::parse(data.as_ref())?))
    }

    /// Phase 1: obtain the first nonce and the session cookie.
    pub async fn issue_nonce(&self) -> Result<IssuedSession<'_, S>, FusError> {
        let url = format!("{}/NF_DownloadGenerateNonce.do", self.endpoints.fus_base);
        debug!("Requesting nonce from: {url}");

        let state = SessionState::new();
        let authorization = state.authorization.clone();
        let request = self.client.post(&url)
            .timeout(METADATA_TIMEOUT)
            .header(CONTENT_LENGTH, 0);

        let (state, _) = self.execute(state, request, &authorization).await
            .map_err(|e| match e {
                FusError::AuthHandshakeFailed(_) => e,
                e => FusError::AuthHandshakeFailed(e.to_string()),
            })?;

        if state.decrypted_nonce.is_none() {
            return Err(FusError::AuthHandshakeFailed(
                "Server did not provide a nonce value".to_owned()));
        }

        Ok(IssuedSession {
            client: self,
            state,
        })
    }
}

/// Session holding a freshly issued nonce.
pub struct IssuedSession<'a, S> {
    client: &'a SessionClient<S>,
    state: SessionState,
}

impl<'a, S: Signer> IssuedSession<'a, S> {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Phase 2: ask for the metadata of the given build.
    pub async fn binary_inform(
        self,
        model: &str,
        region: &str,
        version: &VersionTriple,
    ) -> Result<InformedSession<'a, S>, FusError> {
        let nonce = self.state.nonce()?;
        let body = message::binary_inform(model, region, version, &nonce);

        let (state, root) = self.client
            .execute_xml(self.state, "NF_DownloadBinaryInform.do", &body)
            .await?;

        // HTTP 200, but the FUS status tells whether the build exists
        match message::fus_status(&root) {
            Some(s) if s == "200" => {}
            Some(s) => return Err(FusError::BinaryNotFound(format!("FUS status {s}"))),
            None => return Err(FusError::BinaryNotFound("Missing FUS status field".to_owned())),
        }

        let metadata = BinaryMetadata::from_response(&root)?;
        debug!("Binary metadata: {metadata:#?}");

        Ok(InformedSession {
            client: self.client,
            state,
            metadata,
        })
    }
}

/// Session that knows which binary it is going to download.
pub struct InformedSession<'a, S> {
    client: &'a SessionClient<S>,
    state: SessionState,
    metadata: BinaryMetadata,
}

impl<'a, S: Signer> InformedSession<'a, S> {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn metadata(&self) -> &BinaryMetadata {
        &self.metadata
    }

    /// Phase 3: activate the download of the binary.
    pub async fn binary_init(self) -> Result<ActivatedSession<'a, S>, FusError> {
        let nonce = self.state.nonce()?;
        let body = message::binary_init(&self.metadata.filename, &nonce);

        let (state, root) = self.client
            .execute_xml(self.state, "NF_DownloadBinaryInitForMass.do", &body)
            .await?;

        let status = message::fus_status(&root)
            .ok_or_else(|| FusError::FusBadResponse("Missing FUS status field".to_owned()))?;
        if status != "200" {
            return Err(FusError::FusBadResponse(status.to_string()));
        }

        Ok(ActivatedSession {
            client: self.client,
            state,
            metadata: self.metadata,
        })
    }
}

/// Session whose binary can now be downloaded.
pub struct ActivatedSession<'a, S> {
    client: &'a SessionClient<S>,
    state: SessionState,
    metadata: BinaryMetadata,
}

impl<'a, S: Signer> ActivatedSession<'a, S> {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn metadata(&self) -> &BinaryMetadata {
        &self.metadata
    }

    pub fn download_url(&self) -> String {
        // Built by hand: the server answers HTTP 405 if the file parameter is
        // URL-encoded
        format!(
            "{}/NF_DownloadBinaryForMass.do?file={}{}",
            self.client.endpoints.download_base,
            self.metadata.model_path,
            self.metadata.filename,
        )
    }

    /// Start the download. The returned response body is the encrypted
    /// firmware; it is not read here.
    pub async fn download(self) -> Result<(BinaryMetadata, Response), FusError> {
        let url = self.download_url();
        debug!("Downloading from: {url}");

        let nonce = self.state.nonce()?;
        let signature = self.client.signer.sign(&nonce, self.state.session_cookie.as_deref());
        let authorization = Authorization {
            nonce: self.state.encrypted_nonce.clone(),
            signature,
        };

        let request = self.client.client.get(&url).timeout(DOWNLOAD_TIMEOUT);
        let (_, r) = self.client.execute(self.state, request, &authorization.to_string()).await?;

        Ok((self.metadata, r))
    }
}
