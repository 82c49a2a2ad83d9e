use std::collections::BTreeMap;
use std::sync::Arc;

use ossxfer_protocol::{ByteRange, Headers};
use tracing::debug;

use crate::cipher::{CipherReader, ContentCipher};
use crate::envelope::Envelope;
use crate::provider::{ContentMaterial, KeyProvider};
use crate::{BLOCK_SIZE, CEK_ALGORITHM, CryptoError};

/// Object operations the surrounding client may ask the adapter about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    PutObject,
    GetObject,
    MultipartUpload,
    AppendObject,
    CopyObject { replace_metadata: bool },
    SelectObject,
    ProcessObject,
    CreateSelectObjectMeta,
}

/// A byte range widened to cipher block boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedRange {
    /// The range to request from the service.
    pub range: ByteRange,
    /// Leading bytes to discard after decryption.
    pub skip: u64,
    /// Bytes of plaintext the caller asked for.
    pub len: u64,
}

/// Encryption state shared by every part of one multipart upload.
#[derive(Debug)]
pub struct MultipartContext {
    pub material: ContentMaterial,
    pub data_size: u64,
    pub part_size: u64,
}

impl MultipartContext {
    /// Envelope headers to send with init-multipart-upload.
    pub fn headers(&self) -> Headers {
        self.material.envelope.to_headers()
    }
}

/// Client-side encryption integration point for the transfer engine.
#[derive(Clone)]
pub struct CryptoAdapter {
    provider: Arc<dyn KeyProvider>,
}

impl std::fmt::Debug for CryptoAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoAdapter")
            .field("wrap_algorithm", &self.provider.wrap_algorithm())
            .finish()
    }
}

impl CryptoAdapter {
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self { provider }
    }

    /// Rejects operations the envelope cannot support.
    pub fn check_operation(&self, op: Operation) -> Result<(), CryptoError> {
        let name = match op {
            Operation::AppendObject => "append object",
            Operation::CopyObject {
                replace_metadata: true,
            } => "copy object with REPLACE metadata directive",
            Operation::SelectObject => "select object",
            Operation::ProcessObject => "process object",
            Operation::CreateSelectObjectMeta => "create select object meta",
            Operation::PutObject
            | Operation::GetObject
            | Operation::MultipartUpload
            | Operation::CopyObject {
                replace_metadata: false,
            } => return Ok(()),
        };
        Err(CryptoError::UnsupportedOperation(name))
    }

    /// Rounds `part_size` up to a multiple of the cipher block size.
    pub fn adjust_part_size(&self, part_size: u64) -> u64 {
        let size = part_size.max(1);
        size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
    }

    /// Fails unless `part_size` is block aligned.
    ///
    /// Used for part sizes recovered from a checkpoint, which must not be
    /// silently re-planned.
    pub fn check_part_size(&self, part_size: u64) -> Result<(), CryptoError> {
        if part_size == 0 || part_size % BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidPartSize(part_size));
        }
        Ok(())
    }

    /// Widens `range` to block boundaries, capped at the object end.
    pub fn adjust_range(&self, range: ByteRange, object_size: u64) -> AlignedRange {
        let start = range.start - range.start % BLOCK_SIZE;
        let block_end = (range.end / BLOCK_SIZE + 1) * BLOCK_SIZE - 1;
        let end = block_end.min(object_size.saturating_sub(1)).max(range.end);
        AlignedRange {
            range: ByteRange::new(start, end),
            skip: range.start - start,
            len: range.len(),
        }
    }

    /// Creates content material for a single-shot put of `size` bytes.
    pub fn new_content(&self, size: u64) -> Result<ContentMaterial, CryptoError> {
        let mut material = ContentMaterial::generate(self.provider.as_ref())?;
        material.envelope.unencrypted_length = Some(size);
        Ok(material)
    }

    /// Creates the shared encryption context for a multipart upload.
    pub fn new_multipart_context(
        &self,
        data_size: u64,
        part_size: u64,
    ) -> Result<MultipartContext, CryptoError> {
        self.check_part_size(part_size)?;
        let mut material = ContentMaterial::generate(self.provider.as_ref())?;
        material.envelope.unencrypted_length = Some(data_size);
        material.envelope.data_size = Some(data_size);
        material.envelope.part_size = Some(part_size);
        Ok(MultipartContext {
            material,
            data_size,
            part_size,
        })
    }

    /// Rebuilds a multipart context from a persisted envelope.
    pub fn resume_multipart_context(
        &self,
        metadata: &BTreeMap<String, String>,
    ) -> Result<MultipartContext, CryptoError> {
        let envelope = Envelope::from_metadata(metadata)?
            .ok_or_else(|| CryptoError::InvalidEnvelope("no envelope recorded".into()))?;
        let data_size = envelope
            .data_size
            .ok_or_else(|| CryptoError::InvalidEnvelope("missing data size".into()))?;
        let part_size = envelope
            .part_size
            .ok_or_else(|| CryptoError::InvalidEnvelope("missing part size".into()))?;
        self.check_part_size(part_size)?;
        let material = self.open(envelope)?;
        Ok(MultipartContext {
            material,
            data_size,
            part_size,
        })
    }

    /// Parses the envelope from object metadata, if the object is encrypted.
    pub fn envelope_from_metadata(
        &self,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Option<Envelope>, CryptoError> {
        Envelope::from_metadata(metadata)
    }

    /// Unwraps the content key recorded in `envelope`.
    ///
    /// When the envelope was written under different materials, the provider
    /// is asked for them; their absence is an error.
    pub fn open(&self, envelope: Envelope) -> Result<ContentMaterial, CryptoError> {
        if envelope.cek_algorithm != CEK_ALGORITHM {
            return Err(CryptoError::UnsupportedCipher(envelope.cek_algorithm));
        }

        let provider = if &envelope.material_description == self.provider.material_description()
        {
            Arc::clone(&self.provider)
        } else {
            debug!(
                description = ?envelope.material_description,
                "envelope uses other materials, asking provider"
            );
            self.provider
                .materials_for(&envelope.material_description)
                .ok_or_else(|| {
                    CryptoError::MissingMaterials(format!("{:?}", envelope.material_description))
                })?
        };

        if envelope.wrap_algorithm != provider.wrap_algorithm() {
            return Err(CryptoError::WrapAlgorithmMismatch {
                expected: provider.wrap_algorithm().to_string(),
                found: envelope.wrap_algorithm,
            });
        }

        ContentMaterial::open(provider.as_ref(), envelope)
    }

    /// Returns a cipher positioned at `offset`, which must be block aligned.
    pub fn cipher_at(
        &self,
        material: &ContentMaterial,
        offset: u64,
    ) -> Result<ContentCipher, CryptoError> {
        if offset % BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedOffset(offset));
        }
        Ok(ContentCipher::new(&material.key, &material.iv, offset))
    }

    /// Encrypts `data` in place as the bytes starting at `offset` of the object.
    pub fn encrypt_at(
        &self,
        material: &ContentMaterial,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), CryptoError> {
        self.cipher_at(material, offset)?.apply(data);
        Ok(())
    }

    /// Wraps a ciphertext stream that starts at `offset` with a decrypting reader.
    pub fn decrypt_reader<R>(
        &self,
        reader: R,
        material: &ContentMaterial,
        offset: u64,
    ) -> Result<CipherReader<R>, CryptoError> {
        Ok(CipherReader::new(reader, self.cipher_at(material, offset)?))
    }
}
