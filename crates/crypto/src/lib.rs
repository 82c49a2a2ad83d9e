//! Client-side encryption envelope for resumable transfers.
//!
//! Objects are encrypted with AES-256-CTR under a random per-object content
//! key. The content key and IV are wrapped by a [`KeyProvider`] and stored as
//! user metadata next to the object (the *envelope*). CTR mode lets any
//! block-aligned byte range be encrypted or decrypted independently, which is
//! what makes parallel multipart upload and ranged download possible.
//!
//! The [`CryptoAdapter`] is the single integration point used by the
//! transfer engine: it aligns part sizes and byte ranges to the cipher block,
//! produces and opens envelopes, wraps streams, and rejects operations the
//! envelope cannot support.

mod adapter;
mod cipher;
mod envelope;
mod provider;

pub use adapter::{AlignedRange, CryptoAdapter, MultipartContext, Operation};
pub use cipher::{CipherReader, ContentCipher};
pub use envelope::{Envelope, MaterialDescription};
pub use provider::{ContentMaterial, KeyProvider, LocalKeyProvider};

/// Cipher block size in bytes. Part sizes and range starts align to it.
pub const BLOCK_SIZE: u64 = 16;

/// Content encryption algorithm recorded in the envelope.
pub const CEK_ALGORITHM: &str = "AES/CTR/NoPadding";

/// Content key length in bytes.
pub const KEY_LEN: usize = 32;

/// Counter block (IV) length in bytes.
pub const IV_LEN: usize = 16;

/// Errors produced by the crypto adapter.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("operation not supported on client-side encrypted objects: {0}")]
    UnsupportedOperation(&'static str),

    #[error("part size {0} is not a multiple of the cipher block size")]
    InvalidPartSize(u64),

    #[error("offset {0} is not aligned to the cipher block size")]
    UnalignedOffset(u64),

    #[error("no encryption materials for description {0}")]
    MissingMaterials(String),

    #[error("wrap algorithm mismatch: provider uses {expected}, object uses {found}")]
    WrapAlgorithmMismatch { expected: String, found: String },

    #[error("unsupported content cipher: {0}")]
    UnsupportedCipher(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("key wrap failed: {0}")]
    KeyWrap(String),

    #[error("invalid master key: must be exactly 32 bytes")]
    InvalidMasterKey,
}
