//! Rights-management encryption transform.
//!
//! Content is sealed with XChaCha20-Poly1305 under a 32-byte content key
//! supplied by the application. The key is never persisted; only its
//! SHA-256 fingerprint is kept in the transform's private storage so a
//! wrong key is rejected before any stream is decrypted.
//!
//! Encoded layout: `[nonce: 24 bytes][ciphertext + tag]`.

use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, generic_array::GenericArray},
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{CURRENT_TRANSFORM_VERSION, TransformEnvironment, check_feature_version};
use crate::{
    error::{Error, Result},
    version::FormatVersion,
};

/// Feature identifier of the encryption transform's instance data.
pub const ENCRYPTION_FEATURE: &str = "Microsoft.Metadata.RightsManagementEncryptionTransform";

/// Size of a content key in bytes.
pub const CONTENT_KEY_SIZE: usize = 32;

/// Private stream holding the SHA-256 fingerprint of the content key.
pub const KEY_FINGERPRINT_STREAM: &str = "KeyFingerprint";

const NONCE_SIZE: usize = 24;

/// Encrypts stream contents under an application-supplied content key.
///
/// Not ready until [`set_content_key`](Self::set_content_key) succeeds.
pub struct EncryptionTransform {
    environment: TransformEnvironment,
    key: Option<Box<[u8; CONTENT_KEY_SIZE]>>,
}

impl EncryptionTransform {
    pub(crate) fn new(environment: TransformEnvironment) -> Result<Self> {
        let primary = environment.primary_instance_data();
        if primary.is_empty() {
            let version = FormatVersion::uniform(ENCRYPTION_FEATURE, CURRENT_TRANSFORM_VERSION)?;
            environment.set_primary_instance_data(version.to_bytes()?);
        } else {
            check_feature_version(&environment, &primary, ENCRYPTION_FEATURE)?;
        }
        Ok(Self { environment, key: None })
    }

    /// Supplies the content key.
    ///
    /// The first key given to a new transform is recorded by fingerprint;
    /// later keys must match it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the key does not match the
    /// recorded fingerprint.
    pub fn set_content_key(&mut self, key: [u8; CONTENT_KEY_SIZE]) -> Result<()> {
        let fingerprint = Sha256::digest(key).to_vec();
        match self.environment.instance_stream(KEY_FINGERPRINT_STREAM) {
            Some(stored) if stored != fingerprint => {
                return Err(Error::InvalidArgument {
                    reason: format!(
                        "content key does not match transform {}",
                        self.environment.transform_label()
                    ),
                });
            },
            Some(_) => {},
            None => self.environment.set_instance_stream(KEY_FINGERPRINT_STREAM, fingerprint)?,
        }
        self.key = Some(Box::new(key));
        Ok(())
    }

    /// Whether a content key has been supplied.
    pub fn has_content_key(&self) -> bool {
        self.key.is_some()
    }

    /// Forgets the content key.
    pub fn clear_content_key(&mut self) {
        if let Some(key) = self.key.as_mut() {
            key.fill(0);
        }
        self.key = None;
    }

    /// The transform's persisted state.
    pub fn environment(&self) -> &TransformEnvironment {
        &self.environment
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305> {
        let key = self.key.as_ref().ok_or_else(|| Error::TransformNotReady {
            label: self.environment.transform_label().to_string(),
        })?;
        Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key.as_slice())))
    }

    pub(crate) fn encode(&self, clear: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), clear)
            .map_err(|e| self.failure(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub(crate) fn decode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        if raw.len() < NONCE_SIZE {
            return Err(self.failure(format!("ciphertext of {} bytes is too short", raw.len())));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|e| self.failure(format!("decryption failed: {e}")))
    }

    fn failure(&self, reason: String) -> Error {
        Error::Transform { label: self.environment.transform_label().to_string(), reason }
    }
}

impl std::fmt::Debug for EncryptionTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionTransform")
            .field("label", &self.environment.transform_label())
            .field("has_content_key", &self.has_content_key())
            .finish()
    }
}

impl Drop for EncryptionTransform {
    fn drop(&mut self) {
        self.clear_content_key();
    }
}
