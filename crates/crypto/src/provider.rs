use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::Zeroize;

use crate::envelope::{Envelope, MaterialDescription};
use crate::{CEK_ALGORITHM, CryptoError, IV_LEN, KEY_LEN};

/// AES-GCM nonce size (96 bits).
const NONCE_SIZE: usize = 12;

/// Wrap algorithm recorded by [`LocalKeyProvider`].
pub const LOCAL_WRAP_ALGORITHM: &str = "AES/GCM/NoPadding";

/// Source of master key materials.
///
/// Implementations wrap and unwrap per-object content keys. Key management
/// itself (rotation, storage, KMS access) lives outside this crate.
pub trait KeyProvider: Send + Sync {
    /// Algorithm name recorded in the envelope's wrap-algorithm field.
    fn wrap_algorithm(&self) -> &str;

    /// Description of the materials this provider wraps with.
    fn material_description(&self) -> &MaterialDescription;

    /// Wraps (encrypts) secret key material.
    fn wrap_key(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Unwraps secret key material produced by [`wrap_key`](Self::wrap_key).
    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Returns a provider holding the materials recorded under `desc`, when
    /// it differs from this provider's own description.
    fn materials_for(&self, desc: &MaterialDescription) -> Option<Arc<dyn KeyProvider>>;
}

/// A plaintext content key and counter block plus the envelope that wraps them.
pub struct ContentMaterial {
    pub(crate) key: [u8; KEY_LEN],
    pub(crate) iv: [u8; IV_LEN],
    pub envelope: Envelope,
}

impl ContentMaterial {
    /// Generates a fresh random content key and IV and wraps them with `provider`.
    pub fn generate(provider: &dyn KeyProvider) -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        let envelope = Envelope {
            encrypted_key: provider.wrap_key(&key)?,
            encrypted_iv: provider.wrap_key(&iv)?,
            cek_algorithm: CEK_ALGORITHM.to_string(),
            wrap_algorithm: provider.wrap_algorithm().to_string(),
            material_description: provider.material_description().clone(),
            unencrypted_length: None,
            data_size: None,
            part_size: None,
        };
        Ok(Self { key, iv, envelope })
    }

    /// Unwraps the content key and IV recorded in `envelope`.
    pub fn open(provider: &dyn KeyProvider, envelope: Envelope) -> Result<Self, CryptoError> {
        let key_bytes = provider.unwrap_key(&envelope.encrypted_key)?;
        let iv_bytes = provider.unwrap_key(&envelope.encrypted_iv)?;
        let key: [u8; KEY_LEN] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidEnvelope("content key has wrong length".into()))?;
        let iv: [u8; IV_LEN] = iv_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidEnvelope("counter block has wrong length".into()))?;
        Ok(Self { key, iv, envelope })
    }
}

impl Drop for ContentMaterial {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl std::fmt::Debug for ContentMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentMaterial")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Wraps content keys with a caller-supplied 256-bit master key (AES-256-GCM).
///
/// Objects written under older materials can still be read by registering
/// their master keys with [`with_materials`](Self::with_materials).
#[derive(Clone)]
pub struct LocalKeyProvider {
    master_key: [u8; KEY_LEN],
    description: MaterialDescription,
    others: Vec<Arc<LocalKeyProvider>>,
}

impl Drop for LocalKeyProvider {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

impl LocalKeyProvider {
    pub fn new(master_key: &[u8], description: MaterialDescription) -> Result<Self, CryptoError> {
        let master_key: [u8; KEY_LEN] = master_key
            .try_into()
            .map_err(|_| CryptoError::InvalidMasterKey)?;
        Ok(Self {
            master_key,
            description,
            others: Vec::new(),
        })
    }

    /// Registers additional materials that can unwrap older objects.
    pub fn with_materials(
        mut self,
        master_key: &[u8],
        description: MaterialDescription,
    ) -> Result<Self, CryptoError> {
        let other = LocalKeyProvider::new(master_key, description)?;
        self.others.push(Arc::new(other));
        Ok(self)
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.master_key).map_err(|e| CryptoError::KeyWrap(e.to_string()))
    }
}

impl KeyProvider for LocalKeyProvider {
    fn wrap_algorithm(&self) -> &str {
        LOCAL_WRAP_ALGORITHM
    }

    fn material_description(&self) -> &MaterialDescription {
        &self.description
    }

    fn wrap_key(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher()?
            .encrypt(nonce, plain)
            .map_err(|e| CryptoError::KeyWrap(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wrapped.len() <= NONCE_SIZE {
            return Err(CryptoError::KeyWrap("wrapped key too short".into()));
        }
        let (nonce_bytes, sealed) = wrapped.split_at(NONCE_SIZE);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| CryptoError::KeyWrap("unwrap failed: wrong master key or tampered envelope".into()))
    }

    fn materials_for(&self, desc: &MaterialDescription) -> Option<Arc<dyn KeyProvider>> {
        self.others
            .iter()
            .find(|p| &p.description == desc)
            .map(|p| Arc::clone(p) as Arc<dyn KeyProvider>)
    }
}
