//! Part encryption: AES-256-GCM under a key derived from the master secret.
//!
//! The remote blob for a part is the bare ciphertext; the 12-byte IV and the
//! 16-byte GCM tag live on the part record (base64), and the ciphertext
//! SHA-256 (hex) is verified before any decrypt. Version 1 archives used one
//! IV/tag over the whole ciphertext and are supported for reads only.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// GCM nonce length in bytes.
pub const IV_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Part record lacks IV or auth tag (or they fail to decode).
    #[error("part_crypto_missing:{0}")]
    PartCryptoMissing(u32),

    /// Downloaded ciphertext does not hash to the recorded value.
    #[error("part_hash_mismatch:{0}")]
    PartHashMismatch(u32),

    /// GCM tag verification failed — ciphertext or metadata corrupt.
    #[error("part decryption failed for index {0}")]
    Decrypt(u32),

    #[error("legacy archive decryption failed")]
    LegacyDecrypt,
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Output of encrypting one plaintext chunk.
#[derive(Debug, Clone)]
pub struct EncryptedPart {
    /// Ciphertext without the tag — this is what goes to the provider.
    pub ciphertext: Vec<u8>,
    pub iv: String,
    pub auth_tag: String,
    /// Hex SHA-256 of `ciphertext`.
    pub hash: String,
}

/// Symmetric key derived as SHA-256(master secret).
#[derive(Clone)]
pub struct MasterKey {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").finish_non_exhaustive()
    }
}

impl MasterKey {
    pub fn derive(secret: &str) -> Self {
        let key_bytes = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt one plaintext chunk with a fresh random IV.
    pub fn encrypt_part(&self, index: u32, plaintext: &[u8]) -> Result<EncryptedPart, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encrypt(format!("part {index}: {e}")))?;

        // aes-gcm appends the tag; store it separately so the remote blob is
        // exactly plaintext-length ciphertext.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        let hash = sha256_hex(&sealed);

        Ok(EncryptedPart {
            ciphertext: sealed,
            iv: BASE64.encode(iv),
            auth_tag: BASE64.encode(tag),
            hash,
        })
    }

    /// Verify the ciphertext hash and decrypt one part.
    pub fn decrypt_part(
        &self,
        index: u32,
        ciphertext: &[u8],
        iv_b64: &str,
        tag_b64: &str,
        expected_hash: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        if iv_b64.is_empty() || tag_b64.is_empty() {
            return Err(CryptoError::PartCryptoMissing(index));
        }
        let iv = BASE64
            .decode(iv_b64)
            .map_err(|_| CryptoError::PartCryptoMissing(index))?;
        let tag = BASE64
            .decode(tag_b64)
            .map_err(|_| CryptoError::PartCryptoMissing(index))?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::PartCryptoMissing(index));
        }

        if sha256_hex(ciphertext) != expected_hash {
            return Err(CryptoError::PartHashMismatch(index));
        }

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(&tag);

        self.cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| CryptoError::Decrypt(index))
    }

    /// v1 legacy: one IV and tag at archive level over the whole ciphertext.
    /// Kept for reads of pre-migrated archives; never produced.
    pub fn decrypt_legacy_whole(
        &self,
        ciphertext: &[u8],
        iv_b64: &str,
        tag_b64: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let iv = BASE64.decode(iv_b64).map_err(|_| CryptoError::LegacyDecrypt)?;
        let tag = BASE64
            .decode(tag_b64)
            .map_err(|_| CryptoError::LegacyDecrypt)?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::LegacyDecrypt);
        }

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(&tag);

        self.cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| CryptoError::LegacyDecrypt)
    }
}
