//! Staging and scratch space: disk-pressure gating, per-archive staging
//! trees, per-request scratch directories, bundle zip assembly.
//!
//! Everything under the data dir is transient. Scratch directories are held
//! through a guard that removes them on drop, so every exit path (success,
//! error, client abort) releases the space.

use crate::types::FileEntry;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Free-space classification at the staging root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskPressure {
    /// Plenty of room, proceed immediately.
    Ok,
    /// Between hard and soft limits: finish the current archive, then sleep
    /// one poll interval to let pressure relax.
    Soft,
    /// Below the hard limit: lease no new work.
    Hard,
}

/// Free bytes available to unprivileged writes at `path`.
#[cfg(unix)]
pub fn free_disk_bytes(path: &Path) -> io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_disk_bytes(_path: &Path) -> io::Result<u64> {
    // No statvfs here; report unlimited and rely on ENOSPC at write time.
    Ok(u64::MAX)
}

/// Classification from a free-byte figure — split out so the thresholds are
/// testable without a real filesystem.
pub fn pressure_for(free_bytes: u64, soft_limit_gb: u64, hard_limit_gb: u64) -> DiskPressure {
    const GIB: u64 = 1024 * 1024 * 1024;
    if free_bytes < hard_limit_gb.saturating_mul(GIB) {
        DiskPressure::Hard
    } else if free_bytes < soft_limit_gb.saturating_mul(GIB) {
        DiskPressure::Soft
    } else {
        DiskPressure::Ok
    }
}

/// Current pressure at `root`. Unreadable filesystems count as hard pressure —
/// if we cannot stat the staging root we cannot stage anything either.
pub fn disk_pressure(root: &Path, soft_limit_gb: u64, hard_limit_gb: u64) -> DiskPressure {
    match free_disk_bytes(root) {
        Ok(free) => pressure_for(free, soft_limit_gb, hard_limit_gb),
        Err(e) => {
            warn!("statvfs failed for {:?}: {e}", root);
            DiskPressure::Hard
        }
    }
}

/// A scratch directory removed on drop. Partitioned by caller-supplied label
/// (archive id, request id) so no two workers share a path.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(root: &Path, label: &str) -> io::Result<Self> {
        let path = root.join(label);
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove scratch dir {:?}: {e}", self.path);
            }
        }
    }
}

/// Assemble the bundle payload: a zip of the archive's files with entries
/// named `{index}_{safe_name}`. Entries are stored, not deflated. Returns the
/// finished zip size in bytes.
///
/// Runs synchronous file IO — call through `spawn_blocking`.
pub fn build_bundle_zip(
    staging_dir: &Path,
    files: &[FileEntry],
    zip_path: &Path,
) -> io::Result<u64> {
    if let Some(parent) = zip_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let out = File::create(zip_path)?;
    let mut writer = ZipWriter::new(out);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);

    for (index, entry) in files.iter().enumerate() {
        let source = staging_dir.join(&entry.path);
        let mut input = File::open(&source)?;
        writer.start_file(entry.entry_name(index), options)?;
        io::copy(&mut input, &mut writer)?;
    }

    let mut out = writer.finish()?;
    out.flush()?;
    let size = out.metadata()?.len();
    debug!("built bundle zip {:?} ({} entries, {} bytes)", zip_path, files.len(), size);
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn entry(name: &str, path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: PathBuf::from(path),
            name: name.to_string(),
            original_name: name.to_string(),
            size,
            deleted_at: None,
            kind: None,
            download_count: 0,
            preview_count: 0,
            thumbnail: None,
        }
    }

    #[test]
    fn test_pressure_thresholds() {
        assert_eq!(pressure_for(100 * GIB, 10, 2), DiskPressure::Ok);
        assert_eq!(pressure_for(10 * GIB, 10, 2), DiskPressure::Ok);
        assert_eq!(pressure_for(10 * GIB - 1, 10, 2), DiskPressure::Soft);
        assert_eq!(pressure_for(2 * GIB, 10, 2), DiskPressure::Soft);
        assert_eq!(pressure_for(2 * GIB - 1, 10, 2), DiskPressure::Hard);
        assert_eq!(pressure_for(0, 10, 2), DiskPressure::Hard);
    }

    #[test]
    fn test_free_disk_bytes_reports_something() {
        let tmp = TempDir::new().unwrap();
        let free = free_disk_bytes(tmp.path()).unwrap();
        assert!(free > 0);
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let scratch = ScratchDir::create(tmp.path(), "req-1").unwrap();
            std::fs::write(scratch.file("part.bin"), b"bytes").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_bundle_zip_layout() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("f0"), b"A").unwrap();
        std::fs::write(staging.join("f1"), b"BB").unwrap();

        let files = vec![entry("a.txt", "f0", 1), entry("b.txt", "f1", 2)];
        let zip_path = tmp.path().join("work").join("bundle.zip");
        let size = build_bundle_zip(&staging, &files, &zip_path).unwrap();
        assert!(size > 0);
        assert_eq!(std::fs::metadata(&zip_path).unwrap().len(), size);

        let mut archive = zip::ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);

        let mut content = String::new();
        archive
            .by_name("1_b.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "BB");
    }
}
