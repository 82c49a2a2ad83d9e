use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::{Bytes, BytesMut};

use crate::TransferError;

// ---------------------------------------------------------------------------
// Source files
// ---------------------------------------------------------------------------

/// Size and modification time (ms since the Unix epoch) of a local file.
pub(crate) fn file_identity(path: &Path) -> Result<(u64, i64), TransferError> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(TransferError::InvalidArgument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok((meta.len(), mtime))
}

/// Reads exactly `len` bytes starting at `start` on a blocking thread.
///
/// A file that has become shorter than the recorded size is reported as
/// [`TransferError::SourceChanged`].
pub(crate) async fn read_range(
    path: PathBuf,
    start: u64,
    len: u64,
) -> Result<BytesMut, TransferError> {
    tokio::task::spawn_blocking(move || read_range_blocking(&path, start, len)).await?
}

fn read_range_blocking(path: &Path, start: u64, len: u64) -> Result<BytesMut, TransferError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;

    let mut buf = BytesMut::zeroed(len as usize);
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(TransferError::SourceChanged(format!(
                "{} ended at {} while reading [{start}, {})",
                path.display(),
                start + filled as u64,
                start + len
            )));
        }
        filled += n;
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Temporary download files
// ---------------------------------------------------------------------------

/// A preallocated file written at explicit offsets by concurrent workers.
#[derive(Debug, Clone)]
pub(crate) struct SegmentFile {
    file: Arc<File>,
    path: PathBuf,
}

impl SegmentFile {
    /// Creates (or truncates) `path` and sets its length to `size`.
    ///
    /// The file is sparse where the platform supports it.
    pub(crate) fn create(path: &Path, size: u64) -> Result<Self, TransferError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Reopens a file left by an earlier run. Fails unless it exists with
    /// exactly `size` bytes.
    pub(crate) fn reopen(path: &Path, size: u64) -> Result<Self, TransferError> {
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != size {
            return Err(TransferError::InvalidArgument(format!(
                "{} has {len} bytes, expected {size}",
                path.display()
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `data` at `offset` on a blocking thread.
    pub(crate) async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), TransferError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset)).await??;
        Ok(())
    }

    /// Flushes data to stable storage.
    pub(crate) async fn sync(&self) -> Result<(), TransferError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_all()).await??;
        Ok(())
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Random suffix appended to the target path for the temporary file.
pub(crate) fn temp_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    format!(".tmp-{}", hex::encode(bytes))
}

/// `path` with `suffix` appended to its final component.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Removes a file, treating a missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Absolute form of `path` without touching the filesystem.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf, TransferError> {
    Ok(std::path::absolute(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn read_range_returns_exact_span() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "src.bin", b"0123456789");
        let data = read_range(path.clone(), 3, 4).await.unwrap();
        assert_eq!(&data[..], b"3456");
        let tail = read_range(path, 8, 2).await.unwrap();
        assert_eq!(&tail[..], b"89");
    }

    #[tokio::test]
    async fn short_file_is_source_changed() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "src.bin", b"01234");
        let err = read_range(path, 3, 4).await.unwrap_err();
        assert!(matches!(err, TransferError::SourceChanged(_)));
    }

    #[test]
    fn identity_reports_size() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "src.bin", b"abc");
        let (size, mtime) = file_identity(&path).unwrap();
        assert_eq!(size, 3);
        assert!(mtime > 0);
        assert!(file_identity(dir.path()).is_err());
    }

    #[tokio::test]
    async fn segment_file_writes_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tmp");
        let file = SegmentFile::create(&path, 10).unwrap();
        file.write_at(5, Bytes::from_static(b"world")).await.unwrap();
        file.write_at(0, Bytes::from_static(b"hello")).await.unwrap();
        file.sync().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn reopen_checks_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tmp");
        SegmentFile::create(&path, 10).unwrap();
        assert!(SegmentFile::reopen(&path, 10).is_ok());
        assert!(SegmentFile::reopen(&path, 11).is_err());
        assert!(SegmentFile::reopen(&dir.path().join("missing"), 10).is_err());
    }

    #[test]
    fn temp_suffix_shape() {
        let a = temp_suffix();
        assert!(a.starts_with(".tmp-"));
        assert_eq!(a.len(), 5 + 16);
        assert_ne!(a, temp_suffix());
    }

    #[test]
    fn suffix_appends_to_file_name() {
        let p = with_suffix(Path::new("/data/out.bin"), ".tmp-ab");
        assert_eq!(p, PathBuf::from("/data/out.bin.tmp-ab"));
    }

    #[test]
    fn remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        remove_if_exists(&dir.path().join("nope")).unwrap();
    }
}
