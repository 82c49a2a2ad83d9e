//! Sanity checks applied to checkpoint records before they are trusted.
//!
//! A record that fails any check is discarded by the caller; the check only
//! reports why.

use std::collections::HashSet;

use ossxfer_protocol::ObjectInfo;

use crate::MAX_PART_COUNT;
use crate::plan::{part_count, plan_parts, plan_segments};
use crate::types::{DownloadRecord, UploadRecord};

/// Identity of the local source an upload record must describe.
#[derive(Debug, Clone)]
pub struct UploadSource<'a> {
    pub bucket: &'a str,
    pub object_name: &'a str,
    pub abspath: &'a str,
    pub size: u64,
    pub mtime: i64,
}

/// Identity of the remote object a download record must describe.
#[derive(Debug, Clone)]
pub struct DownloadTarget<'a> {
    pub bucket: &'a str,
    pub object_name: &'a str,
    pub abspath: &'a str,
    pub info: &'a ObjectInfo,
    pub version_id: Option<&'a str>,
}

/// Checks an upload record against the current source file.
pub fn check_upload_record(record: &UploadRecord, source: &UploadSource<'_>) -> Result<(), String> {
    if record.bucket != source.bucket
        || record.object_name != source.object_name
        || record.abspath != source.abspath
    {
        return Err("record describes a different transfer".into());
    }
    if record.size != source.size {
        return Err(format!(
            "source size changed: {} -> {}",
            record.size, source.size
        ));
    }
    if record.mtime != source.mtime {
        return Err("source modification time changed".into());
    }
    if record.upload_id.is_empty() {
        return Err("empty upload id".into());
    }
    if record.part_size == 0 {
        return Err("zero part size".into());
    }
    if part_count(record.size, record.part_size) > MAX_PART_COUNT {
        return Err("part size yields too many parts".into());
    }

    let plan = plan_parts(record.size, record.part_size);
    let mut seen = HashSet::new();
    for part in &record.parts {
        let Some(planned) = plan.get((part.part_number as usize).wrapping_sub(1)) else {
            return Err(format!("part {} out of range", part.part_number));
        };
        if !seen.insert(part.part_number) {
            return Err(format!("part {} recorded twice", part.part_number));
        }
        if part.etag.is_empty() {
            return Err(format!("part {} has no etag", part.part_number));
        }
        if part.size != planned.len() {
            return Err(format!("part {} has wrong size", part.part_number));
        }
    }
    Ok(())
}

/// Checks a download record against a fresh `HEAD` of the object.
pub fn check_download_record(
    record: &DownloadRecord,
    target: &DownloadTarget<'_>,
) -> Result<(), String> {
    if record.bucket != target.bucket
        || record.object_name != target.object_name
        || record.abspath != target.abspath
    {
        return Err("record describes a different transfer".into());
    }
    if record.etag != target.info.etag
        || record.size != target.info.size
        || record.last_modified != target.info.last_modified
    {
        return Err("object changed on the server".into());
    }
    if record.version_id.as_deref() != target.version_id {
        return Err("object version differs".into());
    }
    if record.part_size == 0 {
        return Err("zero part size".into());
    }
    if record.tmp_suffix.is_empty() || record.tmp_suffix.contains(['/', '\\']) {
        return Err("invalid temp suffix".into());
    }

    let plan = plan_segments(record.size, record.part_size);
    let mut seen = HashSet::new();
    for seg in &record.segments {
        let Some(planned) = plan.get(seg.index as usize) else {
            return Err(format!("segment {} out of range", seg.index));
        };
        if !seen.insert(seg.index) {
            return Err(format!("segment {} recorded twice", seg.index));
        }
        if seg.start != planned.start || seg.end != planned.end {
            return Err(format!("segment {} has wrong bounds", seg.index));
        }
    }
    Ok(())
}
