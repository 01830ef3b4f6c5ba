//! Unauthenticated acquisition: guess where a build might be published and
//! check the guesses without downloading them.

use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use log::{debug, info, trace};
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::version::VersionTriple;

/// Anything at or below this size is an error page or a placeholder, not a
/// firmware package. This is one binary megabyte, so files between 1,000,000
/// and 1,048,576 bytes are rejected too.
pub const MIN_FIRMWARE_SIZE: u64 = 1024 * 1024;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("No mirror has the firmware ({0} candidates probed)")]
    NoMirrorFound(usize),
    #[error("Probing was cancelled")]
    Cancelled,
}

/// Candidate URL templates. Every host is combined with every path and every
/// filename, in that nesting order. Templates may contain `{model}`,
/// `{region}`, `{pda}`, `{csc}` and `{modem}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ProbeTable {
    pub hosts: Vec<String>,
    pub paths: Vec<String>,
    pub filenames: Vec<String>,
    /// Number of probes in flight at once
    pub batch_size: usize,
    /// Pause between batches
    pub batch_delay_ms: u64,
}

impl Default for ProbeTable {
    fn default() -> Self {
        let strings = |s: &[&str]| -> Vec<String> { s.iter().map(|s| (*s).to_owned()).collect() };

        Self {
            hosts: strings(&[
                "https://samfw.com",
                "https://sfirmware.com",
                "https://samfrew.com",
            ]),
            paths: strings(&[
                "/firmware/{model}/{region}/",
                "/download/{model}/{region}/{pda}/",
            ]),
            filenames: strings(&[
                "{model}_{region}_{pda}_{csc}_{modem}.zip",
                "{pda}_{csc}_{modem}.zip",
                "{model}_{pda}.zip",
            ]),
            batch_size: 5,
            batch_delay_ms: 500,
        }
    }
}

impl ProbeTable {
    /// All candidate URLs in generation order.
    pub fn candidates(&self, model: &str, region: &str, version: &VersionTriple) -> Vec<String> {
        let expand = |template: &str| {
            template
                .replace("{model}", model)
                .replace("{region}", region)
                .replace("{pda}", &version.pda)
                .replace("{csc}", &version.csc)
                .replace("{modem}", version.effective_modem())
        };

        let mut urls = vec![];

        for host in &self.hosts {
            let host = host.trim_end_matches('/');

            for path in &self.paths {
                for filename in &self.filenames {
                    urls.push(format!("{host}{}{}", expand(path), expand(filename)));
                }
            }
        }

        urls
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// What a probe found out about a URL.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProbeResponse {
    pub accessible: bool,
    /// Advertised size, if any
    pub size: Option<u64>,
}

/// Checks whether a URL can be fetched, without fetching it. Failures are
/// reported as inaccessible.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProbeResponse>;
}

impl<P: Prober + ?Sized> Prober for &P {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProbeResponse> {
        (**self).probe(url)
    }
}

/// Prober that sends `HEAD` requests.
#[derive(Clone, Debug)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Prober for HttpProber {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProbeResponse> {
        Box::pin(async move {
            match self.client.head(url).timeout(PROBE_TIMEOUT).send().await {
                Ok(r) if r.status().is_success() => ProbeResponse {
                    accessible: true,
                    size: content_length(r.headers()),
                },
                Ok(r) => {
                    trace!("Probe of {url} returned {}", r.status());
                    ProbeResponse::default()
                }
                Err(e) => {
                    debug!("Probe of {url} failed: {e}");
                    ProbeResponse::default()
                }
            }
        })
    }
}

/// Size from the headers. `Response::content_length` can't be used because
/// a `HEAD` response has no body.
fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// A candidate that is worth downloading.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbeHit {
    /// Position in generation order
    pub index: usize,
    pub url: String,
    pub size: u64,
}

/// Probes the candidates of a [`ProbeTable`] in concurrent batches.
pub struct DirectAcquisitionProbe<P> {
    prober: P,
    table: ProbeTable,
}

impl<P: Prober> DirectAcquisitionProbe<P> {
    pub fn new(prober: P, table: ProbeTable) -> Self {
        Self { prober, table }
    }

    /// Find the first candidate, in generation order, that is accessible and
    /// larger than [`MIN_FIRMWARE_SIZE`]. Each batch is fully joined before it
    /// is evaluated and no candidate after the winner's batch is probed.
    pub async fn find(
        &self,
        model: &str,
        region: &str,
        version: &VersionTriple,
        cancel: &CancellationToken,
    ) -> Result<ProbeHit, ProbeError> {
        let candidates = self.table.candidates(model, region, version);
        let batch_size = self.table.batch_size.max(1);

        debug!("Probing {} candidates in batches of {batch_size}", candidates.len());

        for (batch_index, batch) in candidates.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                    _ = tokio::time::sleep(self.table.batch_delay()) => {}
                }
            }

            let responses = tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                r = future::join_all(batch.iter().map(|url| self.prober.probe(url))) => r,
            };

            let offset = batch_index * batch_size;

            for (i, (url, response)) in batch.iter().zip(responses).enumerate() {
                trace!("Candidate #{}: {url}: {response:?}", offset + i);

                match response {
                    ProbeResponse { accessible: true, size: Some(size) } if size > MIN_FIRMWARE_SIZE => {
                        info!("Found mirror: {url} ({size} bytes)");

                        return Ok(ProbeHit {
                            index: offset + i,
                            url: url.clone(),
                            size,
                        });
                    }
                    ProbeResponse { accessible: true, size } => {
                        debug!("Ignoring {url}: size {size:?} is too small");
                    }
                    _ => {}
                }
            }
        }

        Err(ProbeError::NoMirrorFound(candidates.len()))
    }
}
