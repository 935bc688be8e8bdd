//! Integration coverage for `SimpleQueue`: add, first/next, lock/unlock,
//! count — run against the real public API rather than the in-module
//! unit tests.

use dirqueue::{SimpleQueue, SimpleQueueOptions};
use tempfile::tempdir;

#[test]
fn add_first_next_visits_every_element_once() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("q");
    let mut queue = SimpleQueue::open(&root, SimpleQueueOptions::default()).unwrap();

    let mut added = Vec::new();
    for i in 0..25 {
        added.push(queue.add(format!("payload-{i}").as_bytes()).unwrap());
    }
    added.sort();

    queue.first().unwrap();
    let mut seen = Vec::new();
    while let Some(name) = queue.next().unwrap() {
        seen.push(name);
    }
    assert_eq!(added, seen);
}

#[test]
fn lock_unlock_relock_cycle() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("q");
    let mut queue = SimpleQueue::open(&root, SimpleQueueOptions::default()).unwrap();
    let name = queue.add(b"payload").unwrap();

    assert!(queue.lock(&name, true).unwrap());
    assert!(!queue.lock(&name, true).unwrap());
    assert!(queue.unlock(&name, false).unwrap());
    assert!(queue.lock(&name, true).unwrap());
}

#[test]
fn count_tracks_additions_and_removals() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("q");
    let mut queue = SimpleQueue::open(&root, SimpleQueueOptions::default()).unwrap();
    assert_eq!(0, queue.count().unwrap());

    let mut names = Vec::new();
    for i in 0..10 {
        names.push(queue.add(format!("{i}").as_bytes()).unwrap());
    }
    assert_eq!(10, queue.count().unwrap());

    for name in &names[..4] {
        queue.lock(name, true).unwrap();
        queue.remove(name).unwrap();
    }
    assert_eq!(6, queue.count().unwrap());
}

#[test]
fn purge_tolerates_leftover_lock_marker_mid_remove() {
    // Simulates landing between `remove`'s payload-unlink and
    // lock-marker-rmdir steps: the bucket holds zero payload files but
    // a `.lock` marker directory is still sitting next to them. Two
    // buckets (via maxelts=1) so the first one is eligible for the
    // empty-bucket sweep instead of being retained as the insertion
    // target.
    let dir = tempdir().unwrap();
    let root = dir.path().join("q");
    let mut queue = SimpleQueue::open(
        &root,
        SimpleQueueOptions {
            maxelts: 1,
            umask: None,
        },
    )
    .unwrap();

    let name = queue.add(b"x").unwrap();
    queue.add(b"y").unwrap();
    assert!(queue.lock(&name, true).unwrap());
    let (bucket, element) = name.split_once('/').unwrap();
    std::fs::remove_file(root.join(bucket).join(element)).unwrap();
    assert!(root.join(bucket).join(format!("{element}.lock")).is_dir());

    queue.purge(0, 0, None).unwrap();

    // The lock marker still occupies the bucket, so it must not have
    // been reaped by the empty-bucket sweep.
    assert!(root.join(bucket).is_dir());

    std::fs::remove_dir(root.join(bucket).join(format!("{element}.lock"))).unwrap();
    queue.purge(0, 0, None).unwrap();
    assert!(!root.join(bucket).is_dir());
}

#[test]
fn payload_round_trips_byte_exactly() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("q");
    let mut queue = SimpleQueue::open(&root, SimpleQueueOptions::default()).unwrap();
    let payload = vec![0u8, 1, 2, 255, 254, 0xAB];
    let name = queue.add(&payload).unwrap();

    assert!(queue.lock(&name, true).unwrap());
    assert_eq!(payload, queue.get(&name).unwrap());
    queue.remove(&name).unwrap();
    assert_eq!(0, queue.count().unwrap());
}
