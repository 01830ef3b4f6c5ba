use std::{
    convert::TryInto,
    fmt,
    path::Path,
    str,
};

use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use thiserror::Error;

use crate::crypto::{self, CryptoError, FusKeys, NonceCipher};

const NON_UTF8_MSG: &str = "[Non-UTF-8 data]";

#[derive(Debug, Error)]
pub enum NonceError {
    #[error("Nonce is not exactly 16 bytes")]
    InvalidSize,
    #[error("Failed to decode base64 nonce: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Failed to decrypt nonce: {0}")]
    Crypto(#[from] CryptoError),
}

/// A decrypted nonce issued by the distribution service. Always 16 bytes.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Nonce([u8; 16]);

impl Nonce {
    pub fn from_slice(data: &[u8]) -> Result<Self, NonceError> {
        Ok(Self(data.try_into().map_err(|_| NonceError::InvalidSize)?))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// `LOGIC_CHECK` value for a binary inform request.
    pub fn logic_check_for_version(&self, version: &str) -> String {
        crypto::logic_check(&self.0, version.as_bytes())
    }

    /// `LOGIC_CHECK` value for a binary init request. Only the last 16
    /// characters of the filename stem are used.
    pub fn logic_check_for_filename(&self, filename: &str) -> String {
        let mut data = filename.as_bytes();

        if let Some(n) = data.iter().position(|b| *b == b'.') {
            data = &data[..n];
        }
        if data.len() > 16 {
            data = &data[data.len() - 16..];
        }

        crypto::logic_check(&self.0, data)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({:?})", self.to_string())
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(str::from_utf8(&self.0).unwrap_or(NON_UTF8_MSG))
    }
}

/// Both forms of a nonce after rotation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RotatedNonce {
    /// Value exactly as received in the `NONCE` header
    pub encrypted: String,
    pub decrypted: Nonce,
}

/// The `Authorization` header sent with every distribution service request.
#[derive(Debug, Default)]
pub struct Authorization {
    pub nonce: String,
    pub signature: String,
}

impl Authorization {
    pub fn with_signature(signature: &str) -> Self {
        Self {
            nonce: String::new(),
            signature: signature.to_owned(),
        }
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the new auth mechanism (encrypted nonces) is supported
        write!(
            f,
            "FUS nonce=\"{}\", signature=\"{}\", nc=\"\", type=\"\", realm=\"\", newauth=\"1\"",
            self.nonce,
            self.signature,
        )
    }
}

/// The signing scheme of the distribution service. The session client only
/// relies on this contract and never looks at how the values are computed.
pub trait Signer: Send + Sync {
    /// Turn a raw `NONCE` response header into its usable form.
    fn rotate_nonce(&self, raw: &str) -> Result<RotatedNonce, NonceError>;

    /// Compute the signature for the `Authorization` header of the next
    /// request.
    fn sign(&self, decrypted_nonce: &Nonce, session_cookie: Option<&str>) -> String;
}

/// Signer backed by the service's fixed and flexible keys.
#[derive(Clone, Debug)]
pub struct FusSigner {
    keys: FusKeys,
}

impl FusSigner {
    pub fn new(keys: FusKeys) -> Self {
        Self { keys }
    }

    /// Encrypt a nonce the same way the service does before sending it.
    pub fn encrypt_nonce(&self, nonce: &Nonce) -> String {
        STANDARD.encode(NonceCipher::new(&self.keys.fixed_key).encrypt(nonce.as_bytes()))
    }
}

impl Signer for FusSigner {
    fn rotate_nonce(&self, raw: &str) -> Result<RotatedNonce, NonceError> {
        let decoded = STANDARD.decode(raw.trim())?;
        let plaintext = NonceCipher::new(&self.keys.fixed_key).decrypt(&decoded)?;

        Ok(RotatedNonce {
            encrypted: raw.to_owned(),
            decrypted: Nonce::from_slice(&plaintext)?,
        })
    }

    fn sign(&self, decrypted_nonce: &Nonce, _session_cookie: Option<&str>) -> String {
        let key = self.keys.flexible_key(decrypted_nonce.as_bytes());
        STANDARD.encode(NonceCipher::new(&key).encrypt(decrypted_nonce.as_bytes()))
    }
}

/// Strip any directory components from a server-provided filename.
pub(crate) fn bare_filename(name: &str) -> Option<&str> {
    Path::new(name).file_name().and_then(|n| n.to_str())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn signer() -> FusSigner {
        FusSigner::new(FusKeys::new(
            b"testing_testing_testing_testing_",
            b"testing_testing_",
        ).unwrap())
    }

    #[test]
    fn test_authorization() {
        assert_eq!(Authorization::default().to_string(),
                   r#"FUS nonce="", signature="", nc="", type="", realm="", newauth="1""#);

        let mut auth = Authorization::with_signature("abc");
        auth.nonce = "xyz".to_owned();
        assert_eq!(auth.to_string(),
                   r#"FUS nonce="xyz", signature="abc", nc="", type="", realm="", newauth="1""#);
    }

    #[test]
    fn test_nonce() {
        assert_matches!(Nonce::from_slice(b"testing_testing"), Err(NonceError::InvalidSize));
        assert_matches!(Nonce::from_slice(b"testing_testing_t"), Err(NonceError::InvalidSize));

        assert_eq!(Nonce::from_slice(b"testing_testing_").unwrap().to_string(),
                   "testing_testing_");
        assert_eq!(Nonce::from_slice(b"\xffesting_testing_").unwrap().to_string(),
                   NON_UTF8_MSG);
    }

    #[test]
    fn test_logic_check_for_filename() {
        let nonce = Nonce::from_slice(b"testing_testing_").unwrap();

        assert_eq!(nonce.logic_check_for_version("abc"), "bcabacbabcabacba");
        assert_eq!(nonce.logic_check_for_filename("abc.zip.enc4"), "bcabacbabcabacba");
        assert_eq!(nonce.logic_check_for_filename("xxtesting_testing_.enc4"), "intieg__intieg__");
    }

    #[test]
    fn test_fus_signer() {
        let signer = signer();
        let nonce = Nonce::from_slice(b"testing_testing_").unwrap();

        let encrypted = signer.encrypt_nonce(&nonce);
        assert_eq!(encrypted, "yrJiFOygpIxnq4nbWdT2NLk1Odu8m5+zcFKQL4PzV0A=");

        assert_matches!(signer.rotate_nonce(&encrypted),
                        Ok(r) if r.decrypted == nonce && r.encrypted == encrypted);
        assert_matches!(signer.rotate_nonce("not base64!"), Err(NonceError::Base64(_)));

        assert_eq!(signer.sign(&nonce, None), "9J2R5S8AAXs40SYA92cLHQfWDv/6w5cAeZkPOEDIFGw=");
        // The cookie does not take part in this scheme
        assert_eq!(signer.sign(&nonce, Some("JSESSIONID=1")), signer.sign(&nonce, None));
    }

    #[test]
    fn test_bare_filename() {
        assert_eq!(bare_filename("/neofus/9/SM-F916N_10.zip.enc4"), Some("SM-F916N_10.zip.enc4"));
        assert_eq!(bare_filename("plain.enc4"), Some("plain.enc4"));
        assert_eq!(bare_filename(""), None);
    }
}
