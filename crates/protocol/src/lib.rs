//! Data types exchanged between the resumable transfer engine and the
//! surrounding object storage client.
//!
//! Nothing here performs I/O. The types describe what the narrow object API
//! returns (object identity, part listings, put/complete outputs) and how the
//! service reports structured failures.

pub mod error;
pub mod headers;
pub mod types;

pub use error::{ApiError, ServiceError, ServiceErrorCode};
pub use types::{
    ByteRange, CompleteMultipartOutput, CompletedPartRef, Headers, ObjectInfo, Params, PartInfo,
    PutObjectOutput, UploadPartOutput,
};
