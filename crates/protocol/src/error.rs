//! Errors reported by the object API.

use std::fmt;

/// Error codes carried in the structured body of a service error response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceErrorCode {
    AccessDenied,
    NoSuchBucket,
    NoSuchKey,
    NoSuchUpload,
    InvalidArgument,
    InvalidRange,
    PreconditionFailed,
    PositionNotEqualToLength,
    ObjectNotAppendable,
    /// Any code this crate does not name explicitly.
    Other(String),
}

impl ServiceErrorCode {
    /// Parses the `Code` element of an error response.
    pub fn parse(code: &str) -> Self {
        match code {
            "AccessDenied" => Self::AccessDenied,
            "NoSuchBucket" => Self::NoSuchBucket,
            "NoSuchKey" => Self::NoSuchKey,
            "NoSuchUpload" => Self::NoSuchUpload,
            "InvalidArgument" => Self::InvalidArgument,
            "InvalidRange" => Self::InvalidRange,
            "PreconditionFailed" => Self::PreconditionFailed,
            "PositionNotEqualToLength" => Self::PositionNotEqualToLength,
            "ObjectNotAppendable" => Self::ObjectNotAppendable,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the wire spelling of the code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AccessDenied => "AccessDenied",
            Self::NoSuchBucket => "NoSuchBucket",
            Self::NoSuchKey => "NoSuchKey",
            Self::NoSuchUpload => "NoSuchUpload",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidRange => "InvalidRange",
            Self::PreconditionFailed => "PreconditionFailed",
            Self::PositionNotEqualToLength => "PositionNotEqualToLength",
            Self::ObjectNotAppendable => "ObjectNotAppendable",
            Self::Other(code) => code,
        }
    }

    /// Typical HTTP status for the code, used when building errors locally.
    pub fn default_status(&self) -> u16 {
        match self {
            Self::AccessDenied => 403,
            Self::NoSuchBucket | Self::NoSuchKey | Self::NoSuchUpload => 404,
            Self::PositionNotEqualToLength | Self::ObjectNotAppendable => 409,
            Self::InvalidRange => 416,
            Self::PreconditionFailed => 412,
            Self::InvalidArgument => 400,
            Self::Other(_) => 500,
        }
    }
}

impl fmt::Display for ServiceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service failure with a structured body, keyed by `{status, code}`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("service error {status} {code}: {message}")]
pub struct ServiceError {
    pub status: u16,
    pub code: ServiceErrorCode,
    pub message: String,
    pub request_id: String,
}

impl ServiceError {
    /// Builds an error with the code's default status and no request id.
    pub fn new(code: ServiceErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.default_status(),
            code,
            message: message.into(),
            request_id: String::new(),
        }
    }
}

/// Errors returned by the object API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Returns the service error code, if this is a structured service error.
    pub fn service_code(&self) -> Option<&ServiceErrorCode> {
        match self {
            Self::Service(e) => Some(&e.code),
            _ => None,
        }
    }

    /// `true` when the service reported the multipart upload as unknown.
    pub fn is_no_such_upload(&self) -> bool {
        matches!(self.service_code(), Some(ServiceErrorCode::NoSuchUpload))
    }

    /// `true` for failures that may succeed when the call is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Io(_) => true,
            Self::Service(e) => e.status >= 500,
        }
    }
}
