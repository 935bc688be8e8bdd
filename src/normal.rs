//! The schema-bearing element variant: full add/lock/unlock/get/remove
//! lifecycle.
//!
//! An element's public name is the full relative path `bucket/element`
//! (e.g. `"00000000/0000000123abc"`), exactly as `add`/`first`/`next`
//! hand it back, since `lock`/`get`/`remove`/`touch` all need to know
//! which bucket an element lives in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use log::{debug, trace};
use regex::Regex;

use crate::base::{BaseQueue, LOCKED_DIR};
use crate::error::{QueueError, Result};
use crate::fs_primitives::{self, MkdirOutcome, RmdirOutcome};
use crate::name;
use crate::purge::{self, PurgeWarning, PurgeableQueue};
use crate::schema::{self, DecodedValue, FieldType, FieldValue, Schema};
use crate::umask::UmaskGuard;

/// Default `maxelts` per bucket.
pub const DEFAULT_MAXELTS: usize = 16_000;
/// Bounded-retry cap for `remove`'s re-lock race loop: rather than spin
/// forever waiting for a concurrent locker to let go, give up and
/// surface `Unexpected` once this many attempts have failed.
const REMOVE_RETRY_LIMIT: u32 = 64;

/// Options accepted by `Queue::open`. Deserializable via `serde`/`toml`
/// so a host application can load them from a config file (see
/// `config.rs`), though nothing requires going through a file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct QueueOptions {
    #[serde(default = "default_maxelts")]
    pub maxelts: usize,
    pub umask: Option<u32>,
}

fn default_maxelts() -> usize {
    DEFAULT_MAXELTS
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            maxelts: DEFAULT_MAXELTS,
            umask: None,
        }
    }
}

impl QueueOptions {
    /// Loads `maxelts`/`umask` from a TOML string, the same
    /// `config.rs`-backed helper `SimpleQueueOptions` builds its own
    /// constructor on. The schema itself is never TOML-deserializable
    /// (it takes types and modifiers no config file format needs to
    /// express) and stays a separate argument to `Queue::open`.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        crate::config::from_toml_str(s)
    }

    /// Loads `maxelts`/`umask` from a TOML file at `path`.
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
    let bucket = caps.get(1).unwrap().as_str();
    let element = caps.get(2).unwrap().as_str();
    Ok((bucket, element))
}

fn compound_name(bucket: &str, element: &str) -> String {
    format!("{bucket}/{element}")
}

pub struct Queue {
    base: BaseQueue,
    schema: Schema,
    maxelts: usize,
    umask: Option<u32>,
}

impl Queue {
    /// Opens (creating if necessary) a schema-bearing queue rooted at
    /// `path`.
    pub fn open(path: &Path, schema: Schema, options: QueueOptions) -> Result<Self> {
        let base = BaseQueue::open(path)?;
        Ok(Queue {
            base,
            schema,
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
        Queue {
            base: self.base.copy(),
            schema: self.schema.clone(),
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

    /// Transient count: the sum of sub-directory counts across every
    /// bucket, not a snapshot.
    pub fn count(&self) -> Result<usize> {
        let mut total = 0;
        for bucket in self.base.list_buckets()? {
            total += self.base.count_subdirs(&self.base.bucket_dir(&bucket))?;
        }
        Ok(total)
    }

    fn guard_umask(&self) -> Option<UmaskGuard> {
        self.umask.map(UmaskGuard::install)
    }

    /// Claim a fresh `temporary/<name>` directory, retrying on collision.
    fn claim_temporary(&self) -> Result<(String, PathBuf)> {
        loop {
            let candidate = name::generate();
            let path = self.base.temporary_dir().join(&candidate);
            match fs_primitives::mkdir(&path)? {
                MkdirOutcome::Created => return Ok((candidate, path)),
                MkdirOutcome::Exists => continue,
            }
        }
    }

    /// Select the bucket new elements should be inserted into.
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
                let count = self.base.count_subdirs(&dir)?;
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

    /// Validate and write fields into the staged element directory.
    /// Mandatory fields absent from `fields` fail with `MissingField`;
    /// fields not declared in the schema fail with `InvalidField`.
    fn write_fields(&self, staged: &Path, fields: &HashMap<String, FieldValue>) -> Result<()> {
        for (name, value) in fields {
            if self.schema.get(name).is_none() {
                return Err(QueueError::InvalidField {
                    field: name.clone(),
                    reason: "not declared in schema".to_owned(),
                });
            }
            let ty = self.schema.get(name).unwrap();
            let bytes = schema::encode(name, ty, value)?;
            fs_primitives::write_file_exclusive(&staged.join(name), &bytes)?;
        }
        for (field_name, ty) in self.schema.fields() {
            if !ty.optional && !fields.contains_key(field_name) {
                return Err(QueueError::MissingField(field_name.clone()));
            }
        }
        Ok(())
    }

    /// Adds a new element, returning its compound `bucket/element` name.
    pub fn add(&self, fields: HashMap<String, FieldValue>) -> Result<String> {
        let _umask = self.guard_umask();
        let (_temp_name, staged) = self.claim_temporary()?;
        self.write_fields(&staged, &fields)?;

        loop {
            let bucket = self.select_insertion_bucket()?;
            let candidate = name::generate();
            let dest = self.base.bucket_dir(&bucket).join(&candidate);
            if fs_primitives::rename(&staged, &dest)? {
                debug!("added element '{}'", compound_name(&bucket, &candidate));
                return Ok(compound_name(&bucket, &candidate));
            }
            // Someone shares our microsecond; try again with a fresh name.
        }
    }

    fn element_dir(&self, bucket: &str, element: &str) -> PathBuf {
        self.base.bucket_dir(bucket).join(element)
    }

    /// Attempt to lock an element by `mkdir`ing its `locked/` marker.
    /// `EEXIST` (already locked) and `ENOENT` (element gone) resolve to
    /// `false` in permissive mode (the default); fatal otherwise.
    pub fn lock(&mut self, full_name: &str, permissive: bool) -> Result<bool> {
        let (bucket, element) = split_name(full_name)?;
        let dir = self.element_dir(bucket, element);
        let marker = dir.join(LOCKED_DIR);

        match fs_primitives::mkdir(&marker) {
            Ok(MkdirOutcome::Created) => {
                // Guard against the parent element having been removed
                // between our mkdir succeeding on a reused inode and this
                // observation.
                if fs_primitives::lstat(&dir)?.is_none() {
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

    /// Releases a lock via `rmdir`. Strict by default: `ENOENT` is fatal
    /// unless `permissive`, since `unlock` is ordinarily called by the
    /// lock holder.
    pub fn unlock(&mut self, full_name: &str, permissive: bool) -> Result<bool> {
        let (bucket, element) = split_name(full_name)?;
        let marker = self.element_dir(bucket, element).join(LOCKED_DIR);
        match fs_primitives::rmdir(&marker)? {
            RmdirOutcome::Removed => Ok(true),
            RmdirOutcome::Missing if permissive => Ok(false),
            RmdirOutcome::Missing => Err(QueueError::Unexpected(format!(
                "unlock('{full_name}'): no lock held"
            ))),
            // A lock marker is a leaf directory nothing else ever
            // creates children under; finding it non-empty means the
            // on-disk state is corrupt, not an ordinary race.
            RmdirOutcome::NotEmpty => Err(QueueError::Unexpected(format!(
                "unlock('{full_name}'): lock marker unexpectedly not empty"
            ))),
        }
    }

    fn is_locked(&self, bucket: &str, element: &str) -> Result<bool> {
        Ok(fs_primitives::lstat(&self.element_dir(bucket, element).join(LOCKED_DIR))?.is_some())
    }

    /// Reads every schema field of a locked element. Fails with
    /// `NotLocked` if the element isn't currently locked.
    pub fn get(&self, full_name: &str) -> Result<HashMap<String, DecodedValue>> {
        let (bucket, element) = split_name(full_name)?;
        if !self.is_locked(bucket, element)? {
            return Err(QueueError::NotLocked(full_name.to_owned()));
        }
        let dir = self.element_dir(bucket, element);
        let mut out = HashMap::new();
        for (field_name, ty) in self.schema.fields() {
            let field_path = dir.join(field_name);
            match fs_primitives::lstat(&field_path)? {
                Some(_) => {
                    let bytes = fs_primitives::read_file(&field_path)?;
                    out.insert(field_name.clone(), schema::decode(field_name, ty, bytes)?);
                }
                None if ty.optional => continue,
                None => return Err(QueueError::MissingField(field_name.clone())),
            }
        }
        Ok(out)
    }

    /// Removes a locked element: rename into `obsolete/`, unlink its
    /// field files, then tear down `locked/` and the directory itself,
    /// looping (bounded) if another process races a fresh lock onto the
    /// already-renamed directory.
    pub fn remove(&mut self, full_name: &str) -> Result<()> {
        let (bucket, element) = split_name(full_name)?;
        if !self.is_locked(bucket, element)? {
            return Err(QueueError::NotLocked(full_name.to_owned()));
        }
        let src = self.element_dir(bucket, element);

        let obsolete_name;
        loop {
            let candidate = name::generate();
            let dest = self.base.obsolete_dir().join(&candidate);
            if fs_primitives::rename(&src, &dest)? {
                obsolete_name = candidate;
                break;
            }
        }
        let obsolete_dir = self.base.obsolete_dir().join(&obsolete_name);

        for field_name in fs_primitives::read_dir(&obsolete_dir, false)? {
            if field_name != LOCKED_DIR {
                fs_primitives::unlink(&obsolete_dir.join(&field_name))?;
            }
        }

        let mut delay = Duration::from_millis(1);
        for attempt in 0..REMOVE_RETRY_LIMIT {
            // Discarded: if a racing locker re-created `locked/` it is
            // itself empty and comes off first, clearing the way for
            // the outer `rmdir` below; if it's gone already that's fine
            // too.
            fs_primitives::rmdir(&obsolete_dir.join(LOCKED_DIR))?;
            match fs_primitives::rmdir(&obsolete_dir)? {
                RmdirOutcome::Removed | RmdirOutcome::Missing => return Ok(()),
                RmdirOutcome::NotEmpty => {
                    trace!("remove('{full_name}') retry {attempt} after re-lock race");
                    thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(100));
                }
            }
        }
        Err(QueueError::Unexpected(format!(
            "remove('{full_name}'): exceeded retry bound racing a re-acquired lock"
        )))
    }

    /// Updates the element directory's mtime so a concurrent `purge`
    /// does not consider it abandoned.
    pub fn touch(&self, full_name: &str) -> Result<()> {
        let (bucket, element) = split_name(full_name)?;
        let dir = self.element_dir(bucket, element);
        let file = std::fs::File::open(&dir).map_err(|e| QueueError::io("open", &dir, e))?;
        file.set_modified(std::time::SystemTime::now())
            .map_err(|e| QueueError::io("utimensat", &dir, e))
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

impl PurgeableQueue for Queue {
    fn base(&self) -> &BaseQueue {
        &self.base
    }

    fn count_in_bucket(&self, bucket: &str) -> Result<usize> {
        self.base.count_subdirs(&self.base.bucket_dir(bucket))
    }

    fn lock_marker(&self, bucket: &str, name: &str) -> PathBuf {
        self.element_dir(bucket, name).join(LOCKED_DIR)
    }

    fn unlock_permissive(&mut self, bucket: &str, name: &str) -> Result<bool> {
        self.unlock(&compound_name(bucket, name), true)
    }

    fn remove_staging_entry(&self, entry: &Path) -> Result<()> {
        match fs_primitives::lstat(entry)? {
            Some(meta) if meta.is_dir() => {
                for child in fs_primitives::read_dir(entry, false)? {
                    if child != LOCKED_DIR {
                        fs_primitives::unlink(&entry.join(&child))?;
                    }
                }
                fs_primitives::rmdir(&entry.join(LOCKED_DIR))?;
                fs_primitives::rmdir(entry)?;
            }
            Some(_) => {
                fs_primitives::unlink(entry)?;
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn options_load_from_toml_str() {
        let opts = QueueOptions::from_toml_str("maxelts = 64\numask = 18").unwrap();
        assert_eq!(64, opts.maxelts);
        assert_eq!(Some(18), opts.umask);
    }

    fn string_schema() -> Schema {
        Schema::build(vec![("string".to_owned(), FieldType::string())]).unwrap()
    }

    #[test]
    fn open_empty_queue_has_only_staging_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        Queue::open(&root, string_schema(), QueueOptions::default()).unwrap();
        let entries: Vec<_> = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        let mut sorted = entries.clone();
        sorted.sort();
        assert_eq!(vec!["obsolete", "temporary"], sorted);
    }

    #[test]
    fn add_creates_first_bucket_with_utf8_bytes() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut queue = Queue::open(&root, string_schema(), QueueOptions::default()).unwrap();

        let mut fields = HashMap::new();
        fields.insert(
            "string".to_owned(),
            FieldValue::String("Th\u{e9}\u{e2}tre Fran\u{e7}ais".to_owned()),
        );
        let name = queue.add(fields).unwrap();
        assert!(name.starts_with("00000000/"));

        let buckets = queue.base.list_buckets().unwrap();
        assert_eq!(vec!["00000000".to_owned()], buckets);

        let (bucket, element) = split_name(&name).unwrap();
        let on_disk = std::fs::read(root.join(bucket).join(element).join("string")).unwrap();
        assert_eq!(
            vec![
                0x54, 0x68, 0xC3, 0xA9, 0xC3, 0xA2, 0x74, 0x72, 0x65, 0x20, 0x46, 0x72, 0x61,
                0x6e, 0xC3, 0xA7, 0x61, 0x69, 0x73
            ],
            on_disk
        );
    }

    #[test]
    fn maxelts_one_spreads_across_buckets() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut queue = Queue::open(
            &root,
            string_schema(),
            QueueOptions {
                maxelts: 1,
                umask: None,
            },
        )
        .unwrap();

        for i in 0..13 {
            let mut fields = HashMap::new();
            fields.insert("string".to_owned(), FieldValue::String(i.to_string()));
            queue.add(fields).unwrap();
        }

        let mut buckets = queue.base.list_buckets().unwrap();
        buckets.sort();
        let expected: Vec<String> = (0..13).map(name::bucket_name).collect();
        assert_eq!(expected, buckets);
        for bucket in &buckets {
            assert_eq!(
                1,
                queue.base.count_subdirs(&queue.base.bucket_dir(bucket)).unwrap()
            );
        }
    }

    #[test]
    fn table_field_roundtrip_is_byte_exact() {
        let schema = Schema::build(vec![
            ("body".to_owned(), FieldType::string()),
            ("header".to_owned(), FieldType::table().optional()),
        ])
        .unwrap();
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut queue = Queue::open(&root, schema, QueueOptions::default()).unwrap();

        let mut fields = HashMap::new();
        fields.insert("body".to_owned(), FieldValue::String("x".to_owned()));
        let mut table = std::collections::BTreeMap::new();
        table.insert("a".to_owned(), "1".to_owned());
        table.insert("b".to_owned(), "2".to_owned());
        fields.insert("header".to_owned(), FieldValue::Table(table));
        let name = queue.add(fields).unwrap();

        let (bucket, element) = split_name(&name).unwrap();
        let on_disk = std::fs::read(root.join(bucket).join(element).join("header")).unwrap();
        assert_eq!(b"a\t1\nb\t2\n".to_vec(), on_disk);
    }

    #[test]
    fn add_missing_mandatory_field_fails() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let queue = Queue::open(&root, string_schema(), QueueOptions::default()).unwrap();
        let err = queue.add(HashMap::new()).unwrap_err();
        assert!(matches!(err, QueueError::MissingField(_)));
    }

    #[test]
    fn lock_twice_then_false() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut queue = Queue::open(&root, string_schema(), QueueOptions::default()).unwrap();
        let mut fields = HashMap::new();
        fields.insert("string".to_owned(), FieldValue::String("v".to_owned()));
        let name = queue.add(fields).unwrap();

        assert_eq!(true, queue.lock(&name, true).unwrap());
        assert_eq!(false, queue.lock(&name, true).unwrap());
    }

    #[test]
    fn get_or_remove_without_lock_fails() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut queue = Queue::open(&root, string_schema(), QueueOptions::default()).unwrap();
        let mut fields = HashMap::new();
        fields.insert("string".to_owned(), FieldValue::String("v".to_owned()));
        let name = queue.add(fields).unwrap();

        assert!(matches!(queue.get(&name), Err(QueueError::NotLocked(_))));
        assert!(matches!(
            queue.remove(&name),
            Err(QueueError::NotLocked(_))
        ));
    }

    #[test]
    fn add_lock_get_remove_lifecycle_drains_queue() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut queue = Queue::open(&root, string_schema(), QueueOptions::default()).unwrap();

        let mut names = Vec::new();
        for i in 0..5 {
            let mut fields = HashMap::new();
            fields.insert("string".to_owned(), FieldValue::String(i.to_string()));
            names.push(queue.add(fields).unwrap());
        }
        assert_eq!(5, queue.count().unwrap());

        for name in &names {
            assert!(queue.lock(name, true).unwrap());
            let fields = queue.get(name).unwrap();
            assert!(fields.contains_key("string"));
            queue.remove(name).unwrap();
        }

        assert_eq!(0, queue.count().unwrap());
        let entries: Vec<_> = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(entries.contains(&"temporary".to_owned()));
        assert!(entries.contains(&"obsolete".to_owned()));
    }

    #[test]
    fn invalid_name_is_rejected() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("q");
        let mut queue = Queue::open(&root, string_schema(), QueueOptions::default()).unwrap();
        assert!(matches!(
            queue.lock("not-a-name", true),
            Err(QueueError::InvalidName(_))
        ));
    }
}
