use crate::error::{CoreError, CoreResult};
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce as AesNonce};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    XCHACHA20_POLY1305,
    AES_256_GCM,
}

impl EncryptionAlgorithm {
    fn nonce_len(self) -> usize {
        match self {
            EncryptionAlgorithm::XCHACHA20_POLY1305 => 24,
            EncryptionAlgorithm::AES_256_GCM => 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBlob {
    pub algorithm: EncryptionAlgorithm,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

pub fn generate_key_32() -> [u8; 32] {
    let mut out = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// AEAD wrapper for blobs at rest. One data key per object store root.
pub struct BlobCipher {
    algorithm: EncryptionAlgorithm,
    key: [u8; 32],
}

impl BlobCipher {
    pub fn new(algorithm: EncryptionAlgorithm, key: [u8; 32]) -> Self {
        Self { algorithm, key }
    }

    pub fn seal(&self, plaintext: &[u8]) -> CoreResult<SealedBlob> {
        let mut nonce = vec![0u8; self.algorithm.nonce_len()];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = match self.algorithm {
            EncryptionAlgorithm::XCHACHA20_POLY1305 => XChaCha20Poly1305::new_from_slice(&self.key)
                .map_err(|e| CoreError::Validation(format!("invalid key: {}", e)))?
                .encrypt(XNonce::from_slice(&nonce), plaintext),
            EncryptionAlgorithm::AES_256_GCM => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| CoreError::Validation(format!("invalid key: {}", e)))?
                .encrypt(AesNonce::from_slice(&nonce), plaintext),
        }
        .map_err(|e| CoreError::ObjectStoreUnavailable(format!("encryption failed: {}", e)))?;
        Ok(SealedBlob {
            algorithm: self.algorithm,
            nonce,
            ciphertext,
        })
    }

    // Blobs sealed before an algorithm change still open: the blob records its own algorithm.
    pub fn open(&self, blob: &SealedBlob) -> CoreResult<Vec<u8>> {
        if blob.nonce.len() != blob.algorithm.nonce_len() {
            return Err(CoreError::Validation(format!(
                "{:?} nonce must be {} bytes",
                blob.algorithm,
                blob.algorithm.nonce_len()
            )));
        }
        match blob.algorithm {
            EncryptionAlgorithm::XCHACHA20_POLY1305 => XChaCha20Poly1305::new_from_slice(&self.key)
                .map_err(|e| CoreError::Validation(format!("invalid key: {}", e)))?
                .decrypt(XNonce::from_slice(&blob.nonce), blob.ciphertext.as_ref()),
            EncryptionAlgorithm::AES_256_GCM => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| CoreError::Validation(format!("invalid key: {}", e)))?
                .decrypt(AesNonce::from_slice(&blob.nonce), blob.ciphertext.as_ref()),
        }
        .map_err(|e| CoreError::ObjectStoreUnavailable(format!("decryption failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_algorithms_open_what_they_seal() {
        let key = generate_key_32();
        for alg in [
            EncryptionAlgorithm::XCHACHA20_POLY1305,
            EncryptionAlgorithm::AES_256_GCM,
        ] {
            let cipher = BlobCipher::new(alg, key);
            let sealed = cipher.seal(b"mfa screenshot").unwrap();
            assert_ne!(sealed.ciphertext, b"mfa screenshot");
            assert_eq!(cipher.open(&sealed).unwrap(), b"mfa screenshot");
        }
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = BlobCipher::new(EncryptionAlgorithm::AES_256_GCM, generate_key_32())
            .seal(b"payload")
            .unwrap();
        let other = BlobCipher::new(EncryptionAlgorithm::AES_256_GCM, generate_key_32());
        assert!(other.open(&sealed).is_err());
    }
}
