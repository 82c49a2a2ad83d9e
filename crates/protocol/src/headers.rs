//! Well-known header names.

/// Prefix applied to user metadata headers.
pub const USER_META_PREFIX: &str = "x-oss-meta-";

/// Client-side encryption envelope fields, stored as user metadata.
///
/// The constants hold the metadata name without [`USER_META_PREFIX`];
/// [`meta_header`] builds the full header name.
pub mod cse {
    pub const KEY: &str = "client-side-encryption-key";
    pub const START: &str = "client-side-encryption-start";
    pub const CEK_ALG: &str = "client-side-encryption-cek-alg";
    pub const WRAP_ALG: &str = "client-side-encryption-wrap-alg";
    pub const MATDESC: &str = "client-side-encryption-matdesc";
    pub const UNENCRYPTED_LENGTH: &str = "client-side-encryption-unencrypted-content-length";
    pub const DATA_SIZE: &str = "client-side-encryption-data-size";
    pub const PART_SIZE: &str = "client-side-encryption-part-size";
}

/// Returns the full header name for a user metadata entry.
pub fn meta_header(name: &str) -> String {
    format!("{USER_META_PREFIX}{name}")
}

/// Strips the user metadata prefix from a header name, if present.
///
/// Matching is case-insensitive, as HTTP header names are.
pub fn strip_meta_prefix(header: &str) -> Option<&str> {
    let prefix_len = USER_META_PREFIX.len();
    if header.len() > prefix_len
        && header.is_char_boundary(prefix_len)
        && header[..prefix_len].eq_ignore_ascii_case(USER_META_PREFIX)
    {
        Some(&header[prefix_len..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_header_roundtrip() {
        let h = meta_header(cse::KEY);
        assert_eq!(h, "x-oss-meta-client-side-encryption-key");
        assert_eq!(strip_meta_prefix(&h), Some(cse::KEY));
    }

    #[test]
    fn strip_prefix_is_case_insensitive() {
        assert_eq!(strip_meta_prefix("X-OSS-Meta-Owner"), Some("Owner"));
    }

    #[test]
    fn strip_prefix_rejects_other_headers() {
        assert_eq!(strip_meta_prefix("content-length"), None);
        assert_eq!(strip_meta_prefix("x-oss-meta-"), None);
    }
}
