//! Tolerant wrappers around the raw filesystem calls the queue is built
//! from. The rule: distinguish *expected races* (return a sentinel so
//! the caller can loop or proceed) from *unexpected failures* (fatal,
//! carrying the originating syscall/path/errno).
//!
//! Every path-touching check here uses `symlink_metadata` (`lstat`), never
//! `metadata` (`stat`), so a symlink sitting where an element is expected
//! is never silently followed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use log::trace;

use crate::error::{QueueError, Result};

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkdirOutcome {
    Created,
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmdirOutcome {
    Removed,
    Missing,
    /// `ENOTEMPTY`/`EEXIST`: something was added to (or re-created
    /// inside) the directory since the caller last observed it empty —
    /// the same benign collision `rename` reports via `Ok(false)`.
    /// Callers that raced a concurrent writer treat this as retryable;
    /// it is never raised as a fatal error.
    NotEmpty,
}

fn is_benign_create(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AlreadyExists | io::ErrorKind::NotFound
    )
}

fn is_benign_remove(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

/// `mkdir(path)`. `EEXIST` followed by an `lstat` confirming the path is
/// really a directory is benign; any other failure, or an `EEXIST` whose
/// target turns out not to be a directory, is fatal.
pub fn mkdir(path: &Path) -> Result<MkdirOutcome> {
    match fs::create_dir(path) {
        Ok(()) => {
            trace!("mkdir '{}' created", path.display());
            Ok(MkdirOutcome::Created)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            match fs::symlink_metadata(path) {
                Ok(meta) if meta.is_dir() => Ok(MkdirOutcome::Exists),
                Ok(_) => Err(QueueError::io("mkdir", path, err)),
                Err(stat_err) if stat_err.kind() == io::ErrorKind::NotFound => {
                    // Raced away between create_dir and lstat; treat as a
                    // benign collision, caller will retry/continue.
                    Ok(MkdirOutcome::Exists)
                }
                Err(stat_err) => Err(QueueError::io("lstat", path, stat_err)),
            }
        }
        Err(err) => Err(QueueError::io("mkdir", path, err)),
    }
}

/// `mkdir -p` style: create every missing path component. Fatal on any
/// unexpected error.
pub fn mkdir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| QueueError::io("mkdir", path, e))
}

/// `rmdir(path)`. `ENOENT` is benign; `ENOTEMPTY`/`EEXIST` (something was
/// added to the directory since the caller last observed it empty) is
/// also benign and reported as `RmdirOutcome::NotEmpty` rather than a
/// fatal error, so a caller racing a concurrent writer can retry.
pub fn rmdir(path: &Path) -> Result<RmdirOutcome> {
    match fs::remove_dir(path) {
        Ok(()) => {
            trace!("rmdir '{}' removed", path.display());
            Ok(RmdirOutcome::Removed)
        }
        Err(err) if is_benign_remove(&err) => Ok(RmdirOutcome::Missing),
        Err(err) if is_not_empty_error(&err) => Ok(RmdirOutcome::NotEmpty),
        Err(err) => Err(QueueError::io("rmdir", path, err)),
    }
}

/// Read a directory's entries minus `.`/`..`. With `strict = true` a
/// missing directory is fatal; otherwise it yields an empty listing,
/// since a concurrent purge may have removed the directory. Callers
/// are responsible for filtering results through the element/bucket
/// name regex.
pub fn read_dir(path: &Path, strict: bool) -> Result<Vec<String>> {
    match fs::read_dir(path) {
        Ok(entries) => {
            let mut names = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| QueueError::io("readdir", path, e))?;
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
            Ok(names)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound && !strict => Ok(Vec::new()),
        Err(err) => Err(QueueError::io("readdir", path, err)),
    }
}

/// `open(path, O_WRONLY|O_CREAT|O_EXCL)`. `EEXIST`/`ENOENT` are benign
/// unless `strict`, in which case they are fatal (used when the caller
/// has already reserved the name and a collision would indicate real
/// corruption rather than an ordinary race).
pub fn create_exclusive(path: &Path, strict: bool) -> Result<Option<File>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if is_benign_create(&err) && !strict => Ok(None),
        Err(err) => Err(QueueError::io("open", path, err)),
    }
}

/// Buffered whole-file read, 8 KiB chunks at a time.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| QueueError::io("open", path, e))?;
    let mut buf = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut chunk)
            .map_err(|e| QueueError::io("read", path, e))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

/// Exclusive-create then buffered write, 8 KiB chunks at a time.
pub fn write_file_exclusive(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::options()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| QueueError::io("open", path, e))?;
    for chunk in data.chunks(CHUNK_SIZE) {
        file.write_all(chunk)
            .map_err(|e| QueueError::io("write", path, e))?;
    }
    Ok(())
}

/// `unlink(path)`. `ENOENT` is benign.
pub fn unlink(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if is_benign_remove(&err) => Ok(()),
        Err(err) => Err(QueueError::io("unlink", path, err)),
    }
}

/// `rename(from, to)`. `ENOTEMPTY`/`EEXIST` on the destination is
/// reported as `false` (a benign collision the caller must retry with a
/// fresh name); any other failure is fatal.
pub fn rename(from: &Path, to: &Path) -> Result<bool> {
    match fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::AlreadyExists | io::ErrorKind::NotFound
            ) || is_not_empty_error(&err) =>
        {
            Ok(false)
        }
        Err(err) => Err(QueueError::io("rename", from, err)),
    }
}

/// Whether `err` is the OS's "target directory not empty" signal.
/// `io::ErrorKind` doesn't distinguish `ENOTEMPTY`/`EEXIST` from
/// ordinary `AlreadyExists`, so both `rename` (renaming onto an
/// occupied name) and `rmdir` (removing a directory something was just
/// added to) inspect the raw errno directly.
#[cfg(unix)]
fn is_not_empty_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTEMPTY) | Some(libc::EEXIST)
    )
}

#[cfg(not(unix))]
fn is_not_empty_error(_err: &io::Error) -> bool {
    false
}

/// `lstat`. Never follows symlinks. `ENOENT` surfaces as `Ok(None)`.
pub fn lstat(path: &Path) -> Result<Option<fs::Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(QueueError::io("lstat", path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mkdir_twice_is_benign() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("foo");
        assert_eq!(MkdirOutcome::Created, mkdir(&target).unwrap());
        assert_eq!(MkdirOutcome::Exists, mkdir(&target).unwrap());
    }

    #[test]
    fn mkdir_over_file_is_fatal() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("foo");
        std::fs::write(&target, b"x").unwrap();
        assert!(mkdir(&target).is_err());
    }

    #[test]
    fn rmdir_missing_is_benign() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("ghost");
        assert_eq!(RmdirOutcome::Missing, rmdir(&target).unwrap());
    }

    #[test]
    fn read_dir_missing_non_strict_is_empty() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("ghost");
        assert_eq!(Vec::<String>::new(), read_dir(&target, false).unwrap());
    }

    #[test]
    fn read_dir_missing_strict_is_fatal() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("ghost");
        assert!(read_dir(&target, true).is_err());
    }

    #[test]
    fn create_exclusive_twice_is_benign() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        assert!(create_exclusive(&target, false).unwrap().is_some());
        assert!(create_exclusive(&target, false).unwrap().is_none());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        write_file_exclusive(&target, b"hello world").unwrap();
        assert_eq!(b"hello world".to_vec(), read_file(&target).unwrap());
    }

    #[test]
    fn rmdir_nonempty_is_benign_not_empty_sentinel() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("foo");
        fs::create_dir(&target).unwrap();
        fs::create_dir(target.join("child")).unwrap();
        assert_eq!(RmdirOutcome::NotEmpty, rmdir(&target).unwrap());
        // The directory is left intact for the caller to retry.
        assert!(target.is_dir());
    }

    #[test]
    fn rename_onto_nonempty_dir_is_benign() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        fs::create_dir(&from).unwrap();
        fs::create_dir(&to).unwrap();
        fs::write(to.join("child"), b"x").unwrap();
        assert_eq!(false, rename(&from, &to).unwrap());
    }
}
