use std::{
    fs,
    io::{Read, Write},
};

use spruce::cache::Cache;
use tempfile::tempdir;

#[test]
fn commit_makes_the_key_resolvable() {
    let dir = tempdir().unwrap();
    let cache = Cache::new(dir.path().join("cache"), 1 << 20).unwrap();

    let payload = vec![7u8; 4096];
    let mut stream = cache.add("k");
    stream.write_all(&payload).unwrap();
    let mut committed = stream.commit().expect("commit should succeed");

    let mut read_back = Vec::new();
    committed.read_to_end(&mut read_back).unwrap();
    assert_eq!(read_back, payload);

    let mut fetched = Vec::new();
    cache.get("k").unwrap().read_to_end(&mut fetched).unwrap();
    assert_eq!(fetched, payload);
}

#[test]
fn uncommitted_stream_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("cache");
    let cache = Cache::new(&root, 1 << 20).unwrap();

    {
        let mut stream = cache.add("k2");
        stream.write_all(b"transient").unwrap();
        // dropped without commit
    }

    assert!(matches!(
        cache.get("k2"),
        Err(spruce::Error::NoSuchMessage(_))
    ));
    assert!(!root.join("tmp").join("k2").exists());
}

#[test]
fn abort_discards_even_after_writes() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("cache");
    let cache = Cache::new(&root, 1 << 20).unwrap();

    let mut stream = cache.add("k3");
    stream.write_all(b"doomed").unwrap();
    stream.abort();
    drop(stream);

    assert!(cache.get("k3").is_err());
    assert!(!root.join("tmp").join("k3").exists());
}

#[test]
fn temp_files_never_appear_in_hash_buckets() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("cache");
    let cache = Cache::new(&root, 1 << 20).unwrap();

    let mut stream = cache.add("in-flight");
    stream.write_all(b"partial").unwrap();

    // while the stream is open, the payload lives under tmp/ only
    assert!(root.join("tmp").join("in-flight").exists());
    for entry in fs::read_dir(&root).unwrap().flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "tmp" {
            continue;
        }
        let inner: Vec<_> = fs::read_dir(entry.path())
            .map(|entries| entries.flatten().collect())
            .unwrap_or_default();
        assert!(inner.is_empty(), "unexpected entry in bucket {name}");
    }

    stream.commit().unwrap();
    assert!(cache.get("in-flight").is_ok());
}

#[test]
fn expire_key_and_expire_all() {
    let dir = tempdir().unwrap();
    let cache = Cache::new(dir.path().join("cache"), 1 << 20).unwrap();

    for key in ["one", "two", "three"] {
        let mut stream = cache.add(key);
        stream.write_all(key.as_bytes()).unwrap();
        stream.commit().unwrap();
    }

    cache.expire_key("two").unwrap();
    assert!(cache.get("two").is_err());
    assert!(cache.get("one").is_ok());

    cache.expire_all().unwrap();
    assert!(cache.get("one").is_err());
    assert!(cache.get("three").is_err());
}

#[test]
fn symlinked_entries_survive_expiration() {
    let dir = tempdir().unwrap();
    let cache = Cache::new(dir.path().join("cache"), 1).unwrap();

    let target = dir.path().join("pinned-target");
    fs::write(&target, b"pinned payload that is definitely over the cap").unwrap();

    let mut stream = cache.add("disposable");
    stream.write_all(b"also clearly over the one byte cap").unwrap();
    stream.commit().unwrap();

    // users pin entries by replacing them with symlinks; fake one in
    // a bucket of our own
    let bucket = dir.path().join("cache").join("00");
    fs::create_dir_all(&bucket).unwrap();
    let pinned = bucket.join("pinned");
    std::os::unix::fs::symlink(&target, &pinned).unwrap();

    cache.expire().unwrap();

    assert!(pinned.exists(), "symlinked entries are never expired");
    assert!(cache.get("disposable").is_err(), "regular entries expire");
}

#[test]
fn rekey_preserves_payload() {
    let dir = tempdir().unwrap();
    let cache = Cache::new(dir.path().join("cache"), 1 << 20).unwrap();

    let mut stream = cache.add("before");
    stream.write_all(b"moving payload").unwrap();
    stream.commit().unwrap();

    cache.rekey("before", "after").unwrap();
    let mut fetched = String::new();
    cache
        .get("after")
        .unwrap()
        .read_to_string(&mut fetched)
        .unwrap();
    assert_eq!(fetched, "moving payload");
    assert!(cache.get("before").is_err());
}
