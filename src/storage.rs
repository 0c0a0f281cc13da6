//! Destination-file I/O for concurrent segment writers.
//!
//! One `JobFile` is shared by every segment worker of a job; each worker is
//! confined to its own disjoint byte range, so positioned writes (pwrite on
//! Unix) need no locking. The file is preallocated on first open (real block
//! allocation via `posix_fallocate` where available) so sparse high-offset
//! writes stay dense on disk.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Handle to a job's destination file. Clone freely across workers; each
/// `write_at` is independent.
#[derive(Debug, Clone)]
pub struct JobFile {
    file: Arc<File>,
    path: PathBuf,
}

impl JobFile {
    /// Open the destination for writing, creating it if missing, never
    /// truncating (resumed segments keep their bytes). Grows the file to
    /// `size` if it is currently shorter.
    pub fn open(path: &Path, size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open destination {}", path.display()))?;

        let job_file = JobFile {
            file: Arc::new(file),
            path: path.to_path_buf(),
        };
        if job_file.len()? < size {
            job_file.preallocate(size)?;
        }
        Ok(job_file)
    }

    /// Grow to `size` bytes. On Unix tries `posix_fallocate` first and falls
    /// back to `set_len` on failure or non-Unix.
    fn preallocate(&self, size: u64) -> Result<()> {
        #[cfg(unix)]
        {
            let fd = self.file.as_raw_fd();
            let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
            if r == 0 {
                return Ok(());
            }
            tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
        }
        self.file
            .set_len(size)
            .context("failed to preallocate destination file")?;
        Ok(())
    }

    /// Write `data` at `offset` without moving any shared cursor.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// Non-Unix fallback: clone the handle and seek+write. Each clone has an
    /// independent cursor, so concurrent disjoint writes stay correct.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    /// Current on-disk length.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata().context("stat destination file")?.len())
    }

    /// Flush data to disk; called before checkpointing terminal state.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("sync destination file")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn open_preallocates_to_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let f = JobFile::open(&path, 100).unwrap();
        assert_eq!(f.len().unwrap(), 100);
    }

    #[test]
    fn positioned_writes_land_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let f = JobFile::open(&path, 100).unwrap();
        let f2 = f.clone();

        f.write_at(0, b"hello").unwrap();
        f2.write_at(50, b"world").unwrap();
        f.write_at(95, b"xy").unwrap();
        f.sync().unwrap();

        let mut buf = vec![0u8; 100];
        File::open(&path).unwrap().read_exact(&mut buf).unwrap();
        assert_eq!(&buf[0..5], b"hello");
        assert_eq!(&buf[50..55], b"world");
        assert_eq!(&buf[95..97], b"xy");
    }

    #[test]
    fn reopen_keeps_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        {
            let f = JobFile::open(&path, 20).unwrap();
            f.write_at(0, b"resume").unwrap();
            f.sync().unwrap();
        }
        let f = JobFile::open(&path, 20).unwrap();
        assert_eq!(f.len().unwrap(), 20);
        let mut buf = vec![0u8; 6];
        File::open(&path).unwrap().read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"resume");
    }

    #[test]
    fn creates_missing_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/out.bin");
        let f = JobFile::open(&path, 10).unwrap();
        assert_eq!(f.len().unwrap(), 10);
        assert!(path.exists());
    }
}
