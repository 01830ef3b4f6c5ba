use std::{
    fmt,
    str::FromStr,
};

use thiserror::Error;

/// Build identifiers of a firmware release, as published in the `latest`
/// field of the version manifest (`<pda>/<csc>[/<modem>]`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionTriple {
    /// Primary firmware version (`DEVICE_PDA_CODE1_VERSION`)
    pub pda: String,
    /// Carrier services version (`DEVICE_CSC_CODE2_VERSION`)
    pub csc: String,
    /// Baseband version. Empty if the build has no separate modem image.
    pub modem: String,
}

impl VersionTriple {
    pub fn new(pda: &str, csc: &str, modem: &str) -> Self {
        Self {
            pda: pda.to_owned(),
            csc: csc.to_owned(),
            modem: modem.to_owned(),
        }
    }

    /// The modem version to send in requests. The pda version stands in when
    /// the manifest has none.
    pub fn effective_modem(&self) -> &str {
        if self.modem.is_empty() {
            &self.pda
        } else {
            &self.modem
        }
    }

    /// Four-component `DEVICE_FW_VERSION` string expected by the distribution
    /// service.
    pub fn to_fw_version(&self) -> String {
        format!("{}/{}/{}/{}", self.pda, self.csc, self.effective_modem(), self.pda)
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pda, self.csc, self.modem)
    }
}

impl FromStr for VersionTriple {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pieces: Vec<&str> = s.trim().split('/').map(str::trim).collect();

        if pieces.len() < 2 {
            return Err(ParseVersionError::TooFewFields);
        } else if pieces.len() > 4 {
            // Some manifests repeat the pda version as a fourth field
            return Err(ParseVersionError::TooManyFields);
        }

        if pieces[0].is_empty() || pieces[1].is_empty() {
            return Err(ParseVersionError::EmptyField);
        }

        Ok(Self::new(pieces[0], pieces[1], pieces.get(2).copied().unwrap_or("")))
    }
}

#[derive(Debug, Error)]
pub enum ParseVersionError {
    #[error("Too few fields (<2) in version string")]
    TooFewFields,
    #[error("Too many fields (>4) in version string")]
    TooManyFields,
    #[error("PDA and CSC versions must not be empty")]
    EmptyField,
}
