//! Log encryption using AES-256 in CTR mode.
//!
//! Log bytes are encrypted in place: the keystream position of a byte is
//! its offset inside the log, so records can be appended, read and moved
//! as a block without re-encrypting anything else. The initial counter
//! block is the header nonce; every rewrite of the log picks a fresh one.
//!
//! The cipher key is derived from the caller's crypt key with HKDF-SHA256
//! and the header salt. Only an 8-byte key check, derived with a different
//! info string, is stored on disk.

use crate::error::{CoreError, CoreResult};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Size of the derived AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the CTR initial counter block in bytes.
pub const NONCE_SIZE: usize = 16;
/// Size of the HKDF salt in bytes.
pub const SALT_SIZE: usize = 16;
/// Size of the stored key check in bytes.
pub const KEY_CHECK_SIZE: usize = 8;

/// Longest accepted crypt key.
pub const MAX_CRYPT_KEY_LEN: usize = 256;

const KEY_INFO: &[u8] = b"mapkv-log-key-v1";
const CHECK_INFO: &[u8] = b"mapkv-key-check-v1";

/// Caller-supplied secret protecting a store.
///
/// Any non-empty byte string up to [`MAX_CRYPT_KEY_LEN`] bytes. The bytes
/// are zeroized when dropped and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CryptKey {
    bytes: Vec<u8>,
}

impl CryptKey {
    /// Creates a crypt key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is empty or longer than
    /// [`MAX_CRYPT_KEY_LEN`].
    pub fn new(bytes: impl AsRef<[u8]>) -> CoreResult<Self> {
        let bytes = bytes.as_ref();
        if bytes.is_empty() || bytes.len() > MAX_CRYPT_KEY_LEN {
            return Err(CoreError::invalid_argument(format!(
                "crypt key must be 1..={MAX_CRYPT_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Returns the raw key bytes.
    ///
    /// Don't log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Key material derived for one salt.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct DerivedKey {
    bytes: [u8; KEY_SIZE],
    check: [u8; KEY_CHECK_SIZE],
}

impl DerivedKey {
    /// Derives the cipher key and key check for `salt`.
    pub(crate) fn derive(crypt_key: &CryptKey, salt: &[u8; SALT_SIZE]) -> CoreResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), crypt_key.as_bytes());

        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(KEY_INFO, &mut bytes)
            .map_err(|_| CoreError::encryption_failed("HKDF expand failed"))?;
        let mut check = [0u8; KEY_CHECK_SIZE];
        hk.expand(CHECK_INFO, &mut check)
            .map_err(|_| CoreError::encryption_failed("HKDF expand failed"))?;

        Ok(Self { bytes, check })
    }

    /// Key fingerprint stored in the header.
    pub(crate) fn check(&self) -> [u8; KEY_CHECK_SIZE] {
        self.check
    }

    /// Returns `true` if `stored` was produced by this key.
    pub(crate) fn matches(&self, stored: &[u8; KEY_CHECK_SIZE]) -> bool {
        // Fold the whole slice so the comparison does not stop early.
        self.check
            .iter()
            .zip(stored)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Builds the cipher for a log written with `nonce`.
    pub(crate) fn cipher(&self, nonce: [u8; NONCE_SIZE]) -> LogCipher {
        LogCipher {
            key: self.bytes,
            nonce,
        }
    }
}

/// CTR keystream bound to one log generation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct LogCipher {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl LogCipher {
    /// XORs `buf` with the keystream starting at log offset `position`.
    ///
    /// Encryption and decryption are the same operation.
    pub(crate) fn apply(&self, position: u64, buf: &mut [u8]) {
        let mut cipher = Aes256Ctr::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&self.nonce),
        );
        cipher.seek(position);
        cipher.apply_keystream(buf);
    }

    /// Returns the nonce this keystream starts from.
    pub(crate) fn nonce(&self) -> [u8; NONCE_SIZE] {
        self.nonce
    }

    /// Returns the same key with a different nonce.
    pub(crate) fn with_nonce(&self, nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            key: self.key,
            nonce,
        }
    }
}

/// Generates a random salt.
pub(crate) fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Generates a random nonce.
///
/// The low 64 bits are cleared so the counter cannot wrap inside a log.
pub(crate) fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce[..8]);
    nonce
}
