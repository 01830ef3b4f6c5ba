use std::{
    fmt,
    time::Duration,
};

use log::debug;
use reqwest::StatusCode;
use thiserror::Error;
use xmltree::Element;

use crate::{
    message::{elem_text, to_utf8_or_error_string},
    version::VersionTriple,
};

pub const FOTA_BASE_URL: &str = "https://fota-cloud-dn.ospserver.net";

const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Version manifest is unavailable: {0}")]
    ManifestUnavailable(String),
    #[error("No firmware version is published for {model} in {region}")]
    NoVersionPublished {
        model: String,
        region: String,
    },
}

/// Looks up the latest published build of a model in a region.
#[derive(Clone, Debug)]
pub struct VersionResolver {
    client: reqwest::Client,
    base_url: String,
}

impl VersionResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, FOTA_BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub async fn resolve(&self, region: &str, model: &str) -> Result<VersionTriple, ResolveError> {
        let url = format!("{}/firmware/{region}/{model}/version.xml", self.base_url);
        debug!("Version manifest URL: {url}");

        let not_published = || ResolveError::NoVersionPublished {
            model: model.to_owned(),
            region: region.to_owned(),
        };

        let r = self.client.get(&url)
            .timeout(MANIFEST_TIMEOUT)
            .send()
            .await
            .map_err(unavailable)?;

        // The manifest server answers 403 for unknown model/region pairs
        if r.status() == StatusCode::FORBIDDEN || r.status() == StatusCode::NOT_FOUND {
            return Err(not_published());
        }
        r.error_for_status_ref().map_err(unavailable)?;

        let data = r.bytes().await.map_err(unavailable)?;
        debug!("Version manifest: {:?}", to_utf8_or_error_string(&data));

        let root = Element::parse(data.as_ref()).map_err(unavailable)?;
        if root.name != "versioninfo" {
            return Err(ResolveError::ManifestUnavailable(
                format!("Unexpected root element: <{}>", root.name)));
        }

        let latest = elem_text(&root, &["firmware", "version", "latest"])
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(not_published)?;

        latest.parse().map_err(|e| ResolveError::ManifestUnavailable(
            format!("Invalid latest version {latest:?}: {e}")))
    }
}

fn unavailable(e: impl fmt::Display) -> ResolveError {
    ResolveError::ManifestUnavailable(e.to_string())
}
