//! The single-payload element variant: each element is a plain file
//! under a bucket, not a directory — no schema, no `locked/`
//! sub-directory.
//!
//! Locking is unified with the directory-based variant by giving a
//! simple element a sibling lock marker `<bucket>/<name>.lock`, created
//! with the same `mkdir`-as-mutex primitive the normal queue uses for
//! its nested `locked/`. The payload stays a bare file (so a consumer
//! that only wants bytes never has to open a directory), while the one
//! cross-process mutual-exclusion mechanism in the whole crate stays
//! uniform across both variants instead of introducing a second,
//! rename-based scheme.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::{debug, trace};
use regex::Regex;

use crate::base::BaseQueue;
use crate::error::{QueueError, Result};
use crate::fs_primitives::{self, MkdirOutcome, RmdirOutcome};
use crate::name;
use crate::purge::{self, PurgeWarning, PurgeableQueue};

const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SimpleQueueOptions {
    #[serde(default = "default_maxelts")]
    pub maxelts: usize,
    pub umask: Option<u32>,
}

fn default_maxelts() -> usize {
    crate::normal::DEFAULT_MAXELTS
}

impl Default for SimpleQueueOptions {
    fn default() -> Self {
        SimpleQueueOptions {
            maxelts: crate::normal::DEFAULT_MAXELTS,
            umask: None,
        }
    }
}

impl SimpleQueueOptions {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        crate::config::from_toml_str(s)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        crate::config::from_toml_file(path)
    }
}

fn compound_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9a-f]{8})/([0-9a-f]{14})$").unwrap())
}

fn split_name(full: &str) -> Result<(&str, &str)> {
    let caps = compound_name_regex()
        .captures(full)
        .ok_or_else(|| QueueError::InvalidName(full.to_owned()))?;
    Ok((caps.get(1).unwrap().as_str(), caps.get(2).unwrap().as_str()))
}

fn compound_name(bucket: &str, element: &str) -> String {
    format!("{bucket}/{element}")
}

pub struct SimpleQueue {
    base: BaseQueue,
    maxelts: usize,
    umask: Option<u32>,
}

impl SimpleQueue {
    pub fn open(path: &Path, options: SimpleQueueOptions) -> Result<Self> {
        let base = BaseQueue::open(path)?;
        Ok(SimpleQueue {
            base,
            maxelts: options.maxelts.max(1),
            umask: options.umask,
        })
    }

    pub fn path(&self) -> &Path {
        self.base.root()
    }

    pub fn id(&self) -> &crate::base::QueueId {
        self.base.id()
    }

    pub fn copy(&self) -> Self {
        SimpleQueue {
            base: self.base.copy(),
            maxelts: self.maxelts,
            umask: self.umask,
        }
    }

    pub fn first(&mut self) -> Result<()> {
        self.base.first()
    }

    pub fn next(&mut self) -> Result<Option<String>> {
        Ok(self
            .base
            .next()?
            .map(|(bucket, elt)| compound_name(&bucket, &elt)))
    }

    fn guard_umask(&self) -> Option<crate::umask::UmaskGuard> {
        self.umask.map(crate::umask::UmaskGuard::install)
    }

    fn element_path(&self, bucket: &str, element: &str) -> PathBuf {
        self.base.bucket_dir(bucket).join(element)
    }

    fn lock_marker_path(&self, bucket: &str, element: &str) -> PathBuf {
        self.base
            .bucket_dir(bucket)
            .join(format!("{element}{LOCK_SUFFIX}"))
    }

    /// Count element-named regular files directly inside `dir`. The
    /// `nlink - 2` trick `BaseQueue` uses for the normal queue's
    /// directory elements does not apply here: a plain file does not
    /// bump its parent's link count, so every count is an actual
    /// directory listing.
    fn count_files(&self, dir: &Path) -> Result<usize> {
        let mut count = 0;
        for entry in fs_primitives::read_dir(dir, false)? {
            if !name::is_element_name(&entry) {
                continue;
            }
            if let Some(meta) = fs_primitives::lstat(&dir.join(&entry))? {
                if meta.is_file() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn count(&self) -> Result<usize> {
        let mut total = 0;
        for bucket in self.base.list_buckets()? {
            total += self.count_files(&self.base.bucket_dir(&bucket))?;
        }
        Ok(total)
    }

    fn select_insertion_bucket(&self) -> Result<String> {
        loop {
            let buckets = self.base.list_buckets()?;
            let Some(highest) = buckets.last().cloned() else {
                let first_bucket = name::bucket_name(0);
                match fs_primitives::mkdir(&self.base.bucket_dir(&first_bucket))? {
                    MkdirOutcome::Created | MkdirOutcome::Exists => return Ok(first_bucket),
                }
            };

            let dir = self.base.bucket_dir(&highest);
            if fs_primitives::lstat(&dir)?.is_none() {
                // Purged mid-read; fall through to create the next one.
            } else {
                let count = self.count_files(&dir)?;
                if count < self.maxelts {
                    return Ok(highest);
                }
            }

            let ordinal = name::bucket_ordinal(&highest).unwrap_or(0);
            let next_bucket = name::bucket_name(ordinal + 1);
            match fs_primitives::mkdir(&self.base.bucket_dir(&next_bucket))? {
                MkdirOutcome::Created | MkdirOutcome::Exists => return Ok(next_bucket),
            }
        }
    }

    /// Writes `payload` under `temporary/` then renames it atomically
    /// into the chosen bucket, returning its compound `bucket/element`
    /// name.
    pub fn add(&self, payload: &[u8]) -> Result<String> {
        use std::io::Write;

        let _umask = self.guard_umask();
        let staged = loop {
            let candidate = name::generate();
            let path = self.base.temporary_dir().join(&candidate);
            if let Some(mut file) = fs_primitives::create_exclusive(&path, false)? {
                file.write_all(payload)
                    .map_err(|e| QueueError::io("write", &path, e))?;
                break path;
            }
        };

        loop {
            let bucket = self.select_insertion_bucket()?;
            let candidate = name::generate();
            let dest = self.base.bucket_dir(&bucket).join(&candidate);
            if fs_primitives::rename(&staged, &dest)? {
                let full = compound_name(&bucket, &candidate);
                debug!("added simple element '{}'", full);
                return Ok(full);
            }
        }
    }

    fn is_locked(&self, bucket: &str, element: &str) -> Result<bool> {
        Ok(fs_primitives::lstat(&self.lock_marker_path(bucket, element))?.is_some())
    }

    /// `mkdir`s the sibling `.lock` marker. Success confirmed by a
    /// follow-up `lstat` of the payload file, guarding against the same
    /// reused-name race the normal queue's `lock` guards against.
    pub fn lock(&mut self, full_name: &str, permissive: bool) -> Result<bool> {
        let (bucket, element) = split_name(full_name)?;
        let marker = self.lock_marker_path(bucket, element);
        match fs_primitives::mkdir(&marker) {
            Ok(MkdirOutcome::Created) => {
                if fs_primitives::lstat(&self.element_path(bucket, element))?.is_none() {
                    return Ok(false);
                }
                Ok(true)
            }
            Ok(MkdirOutcome::Exists) => Ok(false),
            Err(err) if permissive => {
                trace!("lock('{full_name}') permissive failure: {err}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub fn unlock(&mut self, full_name: &str, permissive: bool) -> Result<bool> {
        let (bucket, element) = split_name(full_name)?;
        match fs_primitives::rmdir(&self.lock_marker_path(bucket, element))? {
            RmdirOutcome::Removed => Ok(true),
            RmdirOutcome::Missing if permissive => Ok(false),
            RmdirOutcome::Missing => Err(QueueError::Unexpected(format!(
                "unlock('{full_name}'): no lock held"
            ))),
            // `.lock` is a leaf directory nothing ever populates;
            // non-empty means corrupt on-disk state, not a race.
            RmdirOutcome::NotEmpty => Err(QueueError::Unexpected(format!(
                "unlock('{full_name}'): lock marker unexpectedly not empty"
            ))),
        }
    }

    /// Reads the raw payload bytes of a locked element. A simple element
    /// carries no schema, so there is nothing to decode.
    pub fn get(&self, full_name: &str) -> Result<Vec<u8>> {
        let (bucket, element) = split_name(full_name)?;
        if !self.is_locked(bucket, element)? {
            return Err(QueueError::NotLocked(full_name.to_owned()));
        }
        fs_primitives::read_file(&self.element_path(bucket, element))
    }

    /// Renames the payload into `obsolete/`, unlinks it, then removes the
    /// sibling lock marker left behind in the bucket. Unlike the normal
    /// queue's `remove`, there is no re-lock race to loop against: the
    /// lock marker is a sibling of the payload, not its parent, so
    /// renaming the payload away cannot resurrect a directory the lock
    /// lives inside.
    pub fn remove(&mut self, full_name: &str) -> Result<()> {
        let (bucket, element) = split_name(full_name)?;
        if !self.is_locked(bucket, element)? {
            return Err(QueueError::NotLocked(full_name.to_owned()));
        }
        let src = self.element_path(bucket, element);
        loop {
            let candidate = name::generate();
            let dest = self.base.obsolete_dir().join(&candidate);
            if fs_primitives::rename(&src, &dest)? {
                fs_primitives::unlink(&dest)?;
                break;
            }
        }
        fs_primitives::rmdir(&self.lock_marker_path(bucket, element))?;
        Ok(())
    }

    /// Updates the payload file's mtime so a concurrent `purge` does not
    /// consider it abandoned.
    pub fn touch(&self, full_name: &str) -> Result<()> {
        let (bucket, element) = split_name(full_name)?;
        let path = self.element_path(bucket, element);
        let file =
            std::fs::File::open(&path).map_err(|e| QueueError::io("open", &path, e))?;
        file.set_modified(std::time::SystemTime::now())
            .map_err(|e| QueueError::io("utimensat", &path, e))
    }

    pub fn purge(
        &mut self,
        maxtemp: u64,
        maxlock: u64,
        on_warning: Option<&mut dyn FnMut(PurgeWarning)>,
    ) -> Result<()> {
        purge::purge(self, maxtemp, maxlock, on_warning)
    }
}

impl PurgeableQueue for SimpleQueue {
    fn base(&self) -> &BaseQueue {
        &self.base
    }

    /// Unlike `count()`, this must count *everything* that would stop
    /// an empty-bucket `rmdir` from succeeding, not just live payload
    /// files: a `.lock` marker is a sibling of its payload, so `remove`
    /// unlinking the payload before tearing down the marker (see
    /// `remove` above) leaves a window where the bucket holds zero
    /// elements but a leftover lock directory. Counting that marker
    /// here keeps a zero count a true promise that `rmdir` is safe.
    /// One `read_dir` pass serves both checks.
    fn count_in_bucket(&self, bucket: &str) -> Result<usize> {
        let dir = self.base.bucket_dir(bucket);
        let mut count = 0;
        for entry in fs_primitives::read_dir(&dir, false)? {
            if entry.ends_with(LOCK_SUFFIX) {
                count += 1;
                continue;
            }
            if !name::is_element_name(&entry) {
                continue;
            }
            if let Some(meta) = fs_primitives::lstat(&dir.join(&entry))? {
                if meta.is_file() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn lock_marker(&self, bucket: &str, name: &str) -> PathBuf {
        self.lock_marker_path(bucket, name)
    }

    fn unlock_permissive(&mut self, bucket: &str, name: &str) -> Result<bool> {
        self.unlock(&compound_name(bucket, name), true)
    }

    fn remove_staging_entry(&self, entry: &Path) -> Result<()> {
        fs_primitives::unlink(entry)
    }
}
