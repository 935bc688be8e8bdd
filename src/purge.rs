//! Periodic garbage collection: reaping stale staging entries and
//! releasing abandoned locks without racing active participants. Both
//! `Queue` and `SimpleQueue` implement `PurgeableQueue` so this
//! three-phase sweep is written once.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{trace, warn};

use crate::base::BaseQueue;
use crate::error::Result;
use crate::fs_primitives::{self, RmdirOutcome};

/// Operational warnings purge can emit. These are the *only*
/// user-visible logging the core's contract promises; everything else
/// purge does is ambient debug/trace noise.
#[derive(Debug, Clone)]
pub enum PurgeWarning {
    StaleElement { path: PathBuf },
    StaleLock { bucket: String, name: String },
}

impl std::fmt::Display for PurgeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PurgeWarning::StaleElement { path } => {
                write!(f, "reaping stale staging entry at '{}'", path.display())
            }
            PurgeWarning::StaleLock { bucket, name } => {
                write!(f, "releasing stale lock on '{bucket}/{name}'")
            }
        }
    }
}

fn default_warn(warning: PurgeWarning) {
    warn!("{warning}");
}

/// The capability purge needs from either element variant: enumerate and
/// count buckets (via `BaseQueue`), plus variant-specific knowledge of
/// where a lock marker lives and how to release one permissively.
pub trait PurgeableQueue {
    fn base(&self) -> &BaseQueue;

    /// Count of live elements directly inside `bucket` (sub-directories
    /// for `Queue`, element-named files for `SimpleQueue`).
    fn count_in_bucket(&self, bucket: &str) -> Result<usize>;

    /// Path to the mkdir-based lock marker for a live element, whether or
    /// not it currently exists.
    fn lock_marker(&self, bucket: &str, name: &str) -> PathBuf;

    /// Release a lock permissively (`ENOENT` is not an error); returns
    /// whether a lock was actually present to release.
    fn unlock_permissive(&mut self, bucket: &str, name: &str) -> Result<bool>;

    /// Fully remove one `temporary/`/`obsolete/` staging entry, whatever
    /// shape it has (a bare file for `SimpleQueue`, or a directory
    /// possibly containing field files and a `locked/` marker for
    /// `Queue`).
    fn remove_staging_entry(&self, entry: &Path) -> Result<()>;
}

/// Run the three-phase sweep: empty-bucket sweep, stale-staging sweep,
/// stale-lock sweep. `maxtemp`/`maxlock` of `0`
/// disables the corresponding phase. `purge` never calls `remove`: stale
/// locks are released, not deleted, since the producer may still want to
/// process the element.
pub fn purge<Q: PurgeableQueue>(
    queue: &mut Q,
    maxtemp: u64,
    maxlock: u64,
    on_warning: Option<&mut dyn FnMut(PurgeWarning)>,
) -> Result<()> {
    let mut default_fn = default_warn;
    let emit: &mut dyn FnMut(PurgeWarning) = match on_warning {
        Some(f) => f,
        None => &mut default_fn,
    };

    empty_bucket_sweep(queue)?;
    if maxtemp > 0 {
        stale_staging_sweep(queue, maxtemp, emit)?;
    }
    if maxlock > 0 {
        stale_lock_sweep(queue, maxlock, emit)?;
    }
    Ok(())
}

fn empty_bucket_sweep<Q: PurgeableQueue>(queue: &mut Q) -> Result<()> {
    let buckets = queue.base().list_buckets()?;
    let Some((_last, rest)) = buckets.split_last() else {
        return Ok(());
    };
    for bucket in rest {
        let dir = queue.base().bucket_dir(bucket);
        if fs_primitives::lstat(&dir)?.is_none() {
            continue; // already reaped by a concurrent purge
        }
        if queue.count_in_bucket(bucket)? == 0 {
            // A producer may have added a fresh element into this
            // bucket between the count above and this `rmdir`; that
            // race is benign (the bucket just stops being empty) and
            // must not abort the whole sweep.
            match fs_primitives::rmdir(&dir)? {
                RmdirOutcome::Removed | RmdirOutcome::Missing => {}
                RmdirOutcome::NotEmpty => {
                    trace!("bucket '{}' raced non-empty, skipping", bucket);
                }
            }
        }
    }
    Ok(())
}

fn is_stale(path: &Path, cutoff: SystemTime) -> Result<bool> {
    match fs_primitives::lstat(path)? {
        Some(meta) => {
            let mtime = meta.modified().unwrap_or(SystemTime::now());
            Ok(mtime < cutoff)
        }
        None => Ok(false),
    }
}

fn stale_staging_sweep<Q: PurgeableQueue>(
    queue: &Q,
    maxtemp: u64,
    emit: &mut dyn FnMut(PurgeWarning),
) -> Result<()> {
    let cutoff = SystemTime::now() - Duration::from_secs(maxtemp);
    for staging in [
        queue.base().temporary_dir(),
        queue.base().obsolete_dir(),
    ] {
        for name in fs_primitives::read_dir(&staging, false)? {
            let entry = staging.join(&name);
            if is_stale(&entry, cutoff)? {
                queue.remove_staging_entry(&entry)?;
                emit(PurgeWarning::StaleElement { path: entry });
            }
        }
    }
    Ok(())
}

fn stale_lock_sweep<Q: PurgeableQueue>(
    queue: &mut Q,
    maxlock: u64,
    emit: &mut dyn FnMut(PurgeWarning),
) -> Result<()> {
    let cutoff = SystemTime::now() - Duration::from_secs(maxlock);
    let mut cursor = queue.base().copy();
    cursor.first()?;
    let mut stale = Vec::new();
    while let Some((bucket, name)) = cursor.next()? {
        let marker = queue.lock_marker(&bucket, &name);
        if is_stale(&marker, cutoff)? {
            stale.push((bucket, name));
        }
    }
    for (bucket, name) in stale {
        if queue.unlock_permissive(&bucket, &name)? {
            emit(PurgeWarning::StaleLock { bucket, name });
        }
    }
    Ok(())
}
