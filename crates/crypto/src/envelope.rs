use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ossxfer_protocol::Headers;
use ossxfer_protocol::headers::{cse, meta_header};

use crate::CryptoError;

/// Free-form description identifying the master key materials.
pub type MaterialDescription = BTreeMap<String, String>;

/// Per-object encryption metadata stored alongside the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Content key, wrapped by the key provider.
    pub encrypted_key: Vec<u8>,
    /// Initial counter block, wrapped by the key provider.
    pub encrypted_iv: Vec<u8>,
    pub cek_algorithm: String,
    pub wrap_algorithm: String,
    pub material_description: MaterialDescription,
    pub unencrypted_length: Option<u64>,
    /// Total plaintext size of a multipart upload.
    pub data_size: Option<u64>,
    /// Part size of a multipart upload.
    pub part_size: Option<u64>,
}

impl Envelope {
    /// Encodes the envelope as user metadata (names without the `x-oss-meta-` prefix).
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        meta.insert(cse::KEY.to_string(), STANDARD.encode(&self.encrypted_key));
        meta.insert(cse::START.to_string(), STANDARD.encode(&self.encrypted_iv));
        meta.insert(cse::CEK_ALG.to_string(), self.cek_algorithm.clone());
        meta.insert(cse::WRAP_ALG.to_string(), self.wrap_algorithm.clone());
        if !self.material_description.is_empty() {
            // BTreeMap<String, String> always serializes.
            if let Ok(desc) = serde_json::to_string(&self.material_description) {
                meta.insert(cse::MATDESC.to_string(), desc);
            }
        }
        if let Some(len) = self.unencrypted_length {
            meta.insert(cse::UNENCRYPTED_LENGTH.to_string(), len.to_string());
        }
        if let Some(size) = self.data_size {
            meta.insert(cse::DATA_SIZE.to_string(), size.to_string());
        }
        if let Some(size) = self.part_size {
            meta.insert(cse::PART_SIZE.to_string(), size.to_string());
        }
        meta
    }

    /// Encodes the envelope as request headers.
    pub fn to_headers(&self) -> Headers {
        self.to_metadata()
            .into_iter()
            .map(|(k, v)| (meta_header(&k), v))
            .collect()
    }

    /// Decodes an envelope from object metadata.
    ///
    /// Returns `Ok(None)` when the object carries no envelope at all.
    pub fn from_metadata(meta: &BTreeMap<String, String>) -> Result<Option<Self>, CryptoError> {
        let Some(key) = lookup(meta, cse::KEY) else {
            return Ok(None);
        };

        let encrypted_key = decode_b64(cse::KEY, key)?;
        let encrypted_iv = decode_b64(cse::START, required(meta, cse::START)?)?;
        let cek_algorithm = required(meta, cse::CEK_ALG)?.to_string();
        let wrap_algorithm = required(meta, cse::WRAP_ALG)?.to_string();

        let material_description = match lookup(meta, cse::MATDESC) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
                CryptoError::InvalidEnvelope(format!("{}: {e}", cse::MATDESC))
            })?,
            _ => MaterialDescription::new(),
        };

        Ok(Some(Self {
            encrypted_key,
            encrypted_iv,
            cek_algorithm,
            wrap_algorithm,
            material_description,
            unencrypted_length: optional_u64(meta, cse::UNENCRYPTED_LENGTH)?,
            data_size: optional_u64(meta, cse::DATA_SIZE)?,
            part_size: optional_u64(meta, cse::PART_SIZE)?,
        }))
    }
}

/// Case-insensitive metadata lookup.
fn lookup<'a>(meta: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    meta.get(name).map(String::as_str).or_else(|| {
        meta.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    })
}

fn required<'a>(meta: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str, CryptoError> {
    lookup(meta, name).ok_or_else(|| CryptoError::InvalidEnvelope(format!("missing {name}")))
}

fn decode_b64(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(value)
        .map_err(|e| CryptoError::InvalidEnvelope(format!("{name}: {e}")))
}

fn optional_u64(meta: &BTreeMap<String, String>, name: &str) -> Result<Option<u64>, CryptoError> {
    lookup(meta, name)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|e| CryptoError::InvalidEnvelope(format!("{name}: {e}")))
        })
        .transpose()
}
