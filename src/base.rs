//! Identity and best-effort-FIFO iteration shared by both element
//! variants.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::trace;

use crate::error::Result;
use crate::fs_primitives::{self, mkdir, mkdir_all};
use crate::name::{is_bucket_name, is_element_name};

pub const TEMPORARY_DIR: &str = "temporary";
pub const OBSOLETE_DIR: &str = "obsolete";
pub const LOCKED_DIR: &str = "locked";

/// A queue's stable identity: `(st_dev, st_ino)` on POSIX filesystems, or
/// the canonicalized root path where inode numbers cannot be trusted (e.g.
/// Windows/Cygwin, where inode numbers aren't stable). Two handles opened
/// on the same root compare equal; `copy()` of a handle compares equal to
/// its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueId {
    DeviceInode(u64, u64),
    CanonicalPath(PathBuf),
}

/// Whether sub-directory counts can be read cheaply from `nlink - 2` or
/// must be read by actually listing the directory (the trick is invalid on
/// DOS-family filesystems). Both code paths exist; which one a given
/// filesystem supports is detected once per queue and cached, rather than
/// picked at compile time with `cfg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CountingStrategy {
    NlinkMinusTwo,
    ReadDir,
}

fn detect_counting_strategy(root: &Path) -> Result<CountingStrategy> {
    let probe_parent = root.join(".counting-probe");
    mkdir(&probe_parent)?;
    let probe_child = probe_parent.join("child");
    mkdir(&probe_child)?;

    let meta = fs_primitives::lstat(&probe_parent)?;
    let strategy = match meta {
        Some(meta) if meta.nlink() >= 2 && (meta.nlink() - 2) == 1 => CountingStrategy::NlinkMinusTwo,
        _ => CountingStrategy::ReadDir,
    };

    fs_primitives::rmdir(&probe_child)?;
    fs_primitives::rmdir(&probe_parent)?;
    Ok(strategy)
}

/// Count the live sub-directories of `dir` using whichever strategy this
/// queue detected its filesystem supports.
pub(crate) fn count_subdirs(dir: &Path, strategy: CountingStrategy) -> Result<usize> {
    match strategy {
        CountingStrategy::NlinkMinusTwo => match fs_primitives::lstat(dir)? {
            Some(meta) => Ok(meta.nlink().saturating_sub(2) as usize),
            None => Ok(0),
        },
        CountingStrategy::ReadDir => {
            let names = fs_primitives::read_dir(dir, false)?;
            let mut count = 0;
            for name in names {
                if let Ok(Some(meta)) = fs_primitives::lstat(&dir.join(&name)) {
                    if meta.is_dir() {
                        count += 1;
                    }
                }
            }
            Ok(count)
        }
    }
}

/// Shared root-directory bookkeeping, identity, and the pending-bucket /
/// pending-element iterator cursors. Both `Queue` (normal) and
/// `SimpleQueue` hold one of these and delegate `copy()`/`first()`/
/// `next()`/`count()`'s bucket-walking plumbing to it.
///
/// This is also the entire surface an external "queue-set" collaborator
/// would need to merge iteration across several queues: `id()` to
/// deduplicate members, `copy()` to give the set its own cursor per
/// member, and `first()`/`next()` to drive each member's walk. The merge
/// rule itself — at each step, advance whichever member's `next()` would
/// yield the lexically smallest element name, leaving the rest
/// untouched — lives entirely outside this crate; nothing here
/// implements it.
pub struct BaseQueue {
    root: PathBuf,
    id: QueueId,
    pub(crate) counting_strategy: CountingStrategy,

    pending_buckets: Vec<String>,
    pending_elements: Vec<(String, String)>, // (bucket, element name)
}

impl BaseQueue {
    /// `mkdir`s every path component, then the `temporary/`/`obsolete/`
    /// staging directories.
    pub fn open(root: &Path) -> Result<Self> {
        mkdir_all(root)?;
        mkdir(&root.join(TEMPORARY_DIR))?;
        mkdir(&root.join(OBSOLETE_DIR))?;

        let id = queue_id(root)?;
        let counting_strategy = detect_counting_strategy(root)?;

        Ok(BaseQueue {
            root: root.to_path_buf(),
            id,
            counting_strategy,
            pending_buckets: Vec::new(),
            pending_elements: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn temporary_dir(&self) -> PathBuf {
        self.root.join(TEMPORARY_DIR)
    }

    pub fn obsolete_dir(&self) -> PathBuf {
        self.root.join(OBSOLETE_DIR)
    }

    pub fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    /// Produce an independent iterator over the same queue: shares no
    /// pending-list state with `self`, since the cursor lives on the handle
    /// itself and a single handle cannot support concurrent iteration.
    pub fn copy(&self) -> Self {
        BaseQueue {
            root: self.root.clone(),
            id: self.id.clone(),
            counting_strategy: self.counting_strategy,
            pending_buckets: Vec::new(),
            pending_elements: Vec::new(),
        }
    }

    /// List every bucket directory under the root, sorted lexically.
    pub fn list_buckets(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = fs_primitives::read_dir(&self.root, true)?
            .into_iter()
            .filter(|n| is_bucket_name(n))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Reset the cursor and rebuild `pending_buckets` from a strict
    /// directory read (a missing root is fatal here, since `first()` is
    /// only ever called on an already-opened queue).
    pub fn first(&mut self) -> Result<()> {
        self.pending_buckets = self.list_buckets()?;
        self.pending_elements.clear();
        Ok(())
    }

    /// Pop the head of `pending_elements` if any; otherwise pop a bucket,
    /// list and sort its element names (tolerant of the bucket having
    /// vanished under a concurrent purge), and splice them in. Returns
    /// `None` once every pending bucket and element has been consumed.
    pub fn next(&mut self) -> Result<Option<(String, String)>> {
        loop {
            if !self.pending_elements.is_empty() {
                return Ok(Some(self.pending_elements.remove(0)));
            }
            let Some(bucket) = self.pending_buckets.first().cloned() else {
                return Ok(None);
            };
            self.pending_buckets.remove(0);

            let mut names: Vec<String> = fs_primitives::read_dir(&self.bucket_dir(&bucket), false)?
                .into_iter()
                .filter(|n| is_element_name(n))
                .collect();
            names.sort();
            trace!(
                "bucket '{}' yielded {} pending element(s)",
                bucket,
                names.len()
            );
            self.pending_elements = names.into_iter().map(|n| (bucket.clone(), n)).collect();
        }
    }

    pub fn count_subdirs(&self, dir: &Path) -> Result<usize> {
        count_subdirs(dir, self.counting_strategy)
    }
}

#[cfg(unix)]
fn queue_id(root: &Path) -> Result<QueueId> {
    // `lstat`, not `stat`, matching the crate-wide rule that no
    // path-touching operation follows symlinks: a queue whose root is
    // itself a symlink is identified by the link's own device/inode,
    // not whatever it points at.
    let meta = fs_primitives::lstat(root)?.ok_or_else(|| {
        crate::error::QueueError::Unexpected(format!(
            "queue root '{}' vanished before its identity could be read",
            root.display()
        ))
    })?;
    Ok(QueueId::DeviceInode(meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn queue_id(root: &Path) -> Result<QueueId> {
    let canonical = std::fs::canonicalize(root)
        .map_err(|e| crate::error::QueueError::io("canonicalize", root, e))?;
    Ok(QueueId::CanonicalPath(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_staging_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let base = BaseQueue::open(&root).unwrap();
        assert!(root.join(TEMPORARY_DIR).is_dir());
        assert!(root.join(OBSOLETE_DIR).is_dir());
        assert_eq!(Vec::<String>::new(), base.list_buckets().unwrap());
    }

    #[test]
    fn copy_shares_identity_not_cursor() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut base = BaseQueue::open(&root).unwrap();
        std::fs::create_dir(root.join("00000000")).unwrap();
        base.first().unwrap();
        assert!(!base.pending_buckets.is_empty());

        let copy = base.copy();
        assert_eq!(base.id(), copy.id());
        assert!(copy.pending_buckets.is_empty());
        assert!(copy.pending_elements.is_empty());
    }

    #[test]
    fn distinct_roots_have_distinct_ids() {
        let dir = tempdir().unwrap();
        let a = BaseQueue::open(&dir.path().join("a")).unwrap();
        let b = BaseQueue::open(&dir.path().join("b")).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn first_next_walks_buckets_in_lexical_order() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut base = BaseQueue::open(&root).unwrap();
        for bucket in ["00000001", "00000000"] {
            std::fs::create_dir(root.join(bucket)).unwrap();
        }
        std::fs::create_dir(root.join("00000000").join("00000000000001")).unwrap();
        std::fs::create_dir(root.join("00000001").join("00000000000002")).unwrap();

        base.first().unwrap();
        let mut seen = Vec::new();
        while let Some(item) = base.next().unwrap() {
            seen.push(item);
        }
        assert_eq!(
            vec![
                ("00000000".to_owned(), "00000000000001".to_owned()),
                ("00000001".to_owned(), "00000000000002".to_owned()),
            ],
            seen
        );
    }

    #[test]
    fn next_tolerates_bucket_removed_mid_iteration() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut base = BaseQueue::open(&root).unwrap();
        std::fs::create_dir(root.join("00000000")).unwrap();
        base.first().unwrap();
        std::fs::remove_dir(root.join("00000000")).unwrap();
        assert_eq!(None, base.next().unwrap());
    }
}
