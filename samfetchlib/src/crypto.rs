use std::{
    cmp,
    convert::TryInto,
};

use aes::{Aes128, Aes256};
use block_padding::{NoPadding, Padding, Pkcs7};
use cbc::{Decryptor, Encryptor};
use cipher::{BlockDecrypt, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::generic_array::{ArrayLength, GenericArray, typenum::{U16, U32, Unsigned}};
use thiserror::Error;

/// Block size used by the nonce cipher
pub type NonceBlockSize = U32;
/// Key size used by the nonce cipher
pub type NonceKeySize = U32;
/// Block size of the firmware cipher
pub type FirmwareBlockSize = U16;

/// Symmetric key for decrypting a firmware download.
pub type FirmwareKey = [u8; 16];

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Fixed key has incorrect length")]
    IncorrectFixedKeyLength,
    #[error("Flexible key suffix has incorrect length")]
    IncorrectFlexibleKeySuffixLength,
    #[error("Ciphertext is not a multiple of the block size")]
    CiphertextTooSmall,
    #[error("Logic value must be exactly 16 bytes, but is {0} bytes")]
    MalformedLogicValue(usize),
}

/// Keys needed to talk to the distribution service.
#[derive(Clone, Debug)]
pub struct FusKeys {
    pub fixed_key: [u8; 32],
    pub flexible_key_suffix: [u8; 16],
}

impl FusKeys {
    /// The fixed key must be 32 bytes and the flexible key suffix 16 bytes.
    pub fn new(
        fixed_key: &[u8],
        flexible_key_suffix: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            fixed_key: fixed_key.try_into()
                .map_err(|_| CryptoError::IncorrectFixedKeyLength)?,
            flexible_key_suffix: flexible_key_suffix.try_into()
                .map_err(|_| CryptoError::IncorrectFlexibleKeySuffixLength)?,
        })
    }

    /// Build the per-nonce "flexible key": each byte of `seed` (mod 16) picks
    /// a byte of the fixed key, followed by the suffix.
    pub fn flexible_key(&self, seed: &[u8]) -> Vec<u8> {
        seed.iter()
            .map(|b| self.fixed_key[(b % 16) as usize])
            .chain(self.flexible_key_suffix.iter().copied())
            .collect()
    }
}

/// Scramble a 16-byte seed against a lookup table. Each seed byte selects
/// `table[(byte & 0xf) % table.len()]`. An empty table yields an empty string.
pub fn logic_check(seed: &[u8; 16], table: &[u8]) -> String {
    if table.is_empty() {
        return String::new();
    }

    seed.iter()
        .map(|b| table[(*b as usize & 0xf) % table.len()] as char)
        .collect()
}

/// Derive the firmware decryption key from the build version string and the
/// logic value returned by the binary inform request.
pub fn derive_key(version: &str, logic_value: &str) -> Result<FirmwareKey, CryptoError> {
    let seed: &[u8; 16] = logic_value.as_bytes().try_into()
        .map_err(|_| CryptoError::MalformedLogicValue(logic_value.len()))?;

    Ok(md5::compute(logic_check(seed, version.as_bytes())).into())
}

/// PKCS#7 pad to the block size `B`, optionally truncating the input to a
/// single block first. Inputs already on a block boundary are left alone.
fn pad<B: ArrayLength<u8>>(mut data: &[u8], truncate_to_block_size: bool) -> Vec<u8> {
    let block_size = B::USIZE;

    if truncate_to_block_size {
        data = &data[..cmp::min(data.len(), block_size)];
    }
    let mut buf = data.to_vec();

    if data.is_empty() || data.len() % block_size != 0 {
        buf.resize((data.len() / block_size + 1) * block_size, 0);

        let tail_offset = buf.len() - block_size;
        let tail = GenericArray::<u8, B>::from_mut_slice(&mut buf[tail_offset..]);
        Pkcs7::pad(tail, data.len() % block_size);
    }

    buf
}

/// AES-256-CBC with the quirks the distribution service uses for nonces and
/// signatures: the key is padded or truncated to 32 bytes, the IV is the first
/// 16 bytes of the padded key, and data is PKCS#7 padded to 32-byte blocks.
pub struct NonceCipher {
    dec: Decryptor<Aes256>,
    enc: Encryptor<Aes256>,
}

impl NonceCipher {
    pub fn new(key: &[u8]) -> Self {
        let padded_key = pad::<NonceKeySize>(key, true);
        let iv = &padded_key[..16];

        // Cannot fail: the padded key is always 32 bytes and the IV 16 bytes
        let dec = Decryptor::<Aes256>::new_from_slices(&padded_key, iv).unwrap();
        let enc = Encryptor::<Aes256>::new_from_slices(&padded_key, iv).unwrap();

        Self { dec, enc }
    }

    pub fn encrypt(self, data: &[u8]) -> Vec<u8> {
        let mut buf = pad::<NonceBlockSize>(data, false);
        let len = buf.len();

        // Cannot fail: the buffer is block aligned
        self.enc.encrypt_padded_mut::<NoPadding>(&mut buf, len).unwrap();

        buf
    }

    /// Decrypt and strip the PKCS#7 padding if the last block looks padded.
    /// Data that merely resembles padding is indistinguishable from it.
    pub fn decrypt(self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = self.dec.decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| CryptoError::CiphertextTooSmall)?;

        if !plaintext.is_empty() && plaintext.len() % NonceBlockSize::USIZE == 0 {
            let tail_offset = plaintext.len() - NonceBlockSize::USIZE;
            let tail = GenericArray::<u8, NonceBlockSize>::from_slice(&plaintext[tail_offset..]);

            let len = match Pkcs7::unpad(tail) {
                Ok(s) => tail_offset + s.len(),
                Err(_) => plaintext.len(),
            };

            plaintext.truncate(len);
        }

        Ok(plaintext)
    }
}

/// AES-128-ECB without padding, as used for firmware payloads. Holds no
/// chaining state, so any block-aligned slice can be decrypted independently.
#[derive(Clone)]
pub struct FirmwareCipher(Aes128);

impl FirmwareCipher {
    pub fn new(key: &FirmwareKey) -> Self {
        Self(Aes128::new(GenericArray::from_slice(key)))
    }

    /// Block size in bytes.
    pub const fn block_size() -> usize {
        FirmwareBlockSize::USIZE
    }

    /// Decrypt a block-aligned buffer in place.
    pub fn decrypt_in_place(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() % Self::block_size() != 0 {
            return Err(CryptoError::CiphertextTooSmall);
        }

        for block in buf.chunks_exact_mut(Self::block_size()) {
            self.0.decrypt_block(GenericArray::from_mut_slice(block));
        }

        Ok(())
    }

    /// Encrypt a block-aligned buffer in place. Only needed to build fixtures.
    #[cfg(test)]
    pub fn encrypt_in_place(&self, buf: &mut [u8]) {
        use cipher::BlockEncrypt;

        for block in buf.chunks_exact_mut(Self::block_size()) {
            self.0.encrypt_block(GenericArray::from_mut_slice(block));
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use cipher::generic_array::typenum::U4;
    use hex_literal::hex;

    use super::*;

    #[test]
    fn test_pad() {
        assert_eq!(pad::<U4>(b"", false), [4, 4, 4, 4]);
        assert_eq!(pad::<U4>(b"wxyz", false), b"wxyz");
        assert_eq!(pad::<U4>(b"wxyz!", false), b"wxyz!\x03\x03\x03");
        assert_eq!(pad::<U4>(b"wxyz!", true), b"wxyz");
        assert_eq!(pad::<U4>(b"wx", true), b"wx\x02\x02");
    }

    #[test]
    fn test_flexible_key() {
        let keys = FusKeys::new(
            b"testing_testing_testing_testing_",
            b"testing_testing_",
        ).unwrap();

        assert_eq!(keys.flexible_key(b""), b"testing_testing_");
        assert_eq!(keys.flexible_key(b"abc"), b"esttesting_testing_");

        assert_matches!(FusKeys::new(b"short", b"testing_testing_"),
                        Err(CryptoError::IncorrectFixedKeyLength));
        assert_matches!(FusKeys::new(b"testing_testing_testing_testing_", b"short"),
                        Err(CryptoError::IncorrectFlexibleKeySuffixLength));
    }

    #[test]
    fn test_logic_check() {
        let seed = b"testing_testing_";

        assert_eq!(logic_check(seed, b""), "");
        assert_eq!(logic_check(seed, b"abc"), "bcabacbabcabacba");
        assert_eq!(logic_check(seed, b"testing_testing_"), "intieg__intieg__");
    }

    #[test]
    fn test_derive_key() {
        let key = derive_key("abc", "testing_testing_").unwrap();
        assert_eq!(key, md5::compute(b"bcabacbabcabacba").0);

        // Same inputs, same key
        assert_eq!(derive_key("abc", "testing_testing_").unwrap(), key);
        assert_ne!(derive_key("abd", "testing_testing_").unwrap(), key);

        assert_matches!(derive_key("abc", "testing_testing"),
                        Err(CryptoError::MalformedLogicValue(15)));
        assert_matches!(derive_key("abc", ""),
                        Err(CryptoError::MalformedLogicValue(0)));
    }

    #[test]
    fn test_nonce_cipher() {
        assert_eq!(NonceCipher::new(b"testing_testing_").encrypt(b""),
                   hex!("dd3b9041a4d4f8be4c6aa4cee25776670d3d7ce4383f68f65bbb037575beb7cd"));

        // Keys longer than 32 bytes are truncated
        assert_eq!(NonceCipher::new(b"testing_testing_testing_testing_testing_")
                       .encrypt(b"testing_testing_"),
                   hex!("cab26214eca0a48c67ab89db59d4f634b93539dbbc9b9fb37052902f83f35740"));

        assert_matches!(NonceCipher::new(b"testing_testing_").decrypt(&[0]),
                        Err(CryptoError::CiphertextTooSmall));

        assert_matches!(NonceCipher::new(b"testing_testing_")
                            .decrypt(&hex!("ea016b97268c45b6201797452df6c688a70500f3e18d557474c10a55758b07d9")),
                        Ok(x) if x == b"testing_testing_");

        let ciphertext = NonceCipher::new(b"k").encrypt(b"a round trip through the cipher");
        assert_matches!(NonceCipher::new(b"k").decrypt(&ciphertext),
                        Ok(x) if x == b"a round trip through the cipher");
    }

    #[test]
    fn test_firmware_cipher() {
        let cipher = FirmwareCipher::new(&[7u8; 16]);
        let plaintext = *b"0123456789abcdef0123456789abcdef";

        let mut buf = plaintext;
        cipher.encrypt_in_place(&mut buf);
        assert_ne!(buf, plaintext);

        // ECB: identical plaintext blocks give identical ciphertext blocks
        assert_eq!(buf[..16], buf[16..]);

        cipher.decrypt_in_place(&mut buf).unwrap();
        assert_eq!(buf, plaintext);

        assert_matches!(cipher.decrypt_in_place(&mut [0u8; 17]),
                        Err(CryptoError::CiphertextTooSmall));
    }
}
