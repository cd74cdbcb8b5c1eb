//! Cache behavior across independent cache handles, the way separate
//! evaluations (or separate grader processes) share one cache directory.

use std::fs;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use taskmill::cache::{Cache, CacheError, CacheKeyBuilder};
use taskmill::error::GraderError;
use taskmill::files::FileDescriptor;
use taskmill::limits::ExecutionLimits;

fn cache_at(temp: &TempDir, lock_timeout: Duration) -> Cache {
    Cache::new(
        &temp.path().join("cache"),
        &temp.path().join("cache").join("index.sqlite"),
        lock_timeout,
    )
}

fn inline_key(tag: &str, content: &str) -> taskmill::cache::CacheKey {
    let limits = ExecutionLimits::default();
    let mut builder = CacheKeyBuilder::new(tag, &limits);
    builder
        .file(&FileDescriptor::inline("main.sh", content), None)
        .unwrap();
    builder.finish()
}

#[test]
fn results_survive_across_cache_handles() {
    let temp = TempDir::new().unwrap();
    let key = inline_key("compile:sol", "echo hi");

    {
        let cache = cache_at(&temp, Duration::from_secs(2));
        let mut folder = cache.get_folder(&key).unwrap();
        assert!(!folder.is_complete());
        folder.write_file("sol.exe", b"#!/bin/sh\necho hi\n").unwrap();
        folder.mark_complete().unwrap();
    }

    // A brand new handle over the same directory sees the committed folder
    let cache = cache_at(&temp, Duration::from_secs(2));
    let folder = cache.get_folder(&key).unwrap();
    assert!(folder.is_complete());

    let dest = temp.path().join("restore");
    fs::create_dir_all(&dest).unwrap();
    let restored = folder.restore_file("sol.exe", &dest).unwrap();
    assert_eq!(fs::read(restored).unwrap(), b"#!/bin/sh\necho hi\n");
}

#[test]
fn distinct_keys_get_distinct_folders() {
    let temp = TempDir::new().unwrap();
    let cache = cache_at(&temp, Duration::from_secs(2));

    let a = cache.get_folder(&inline_key("compile:a", "aa")).unwrap();
    let b = cache.get_folder(&inline_key("compile:b", "aa")).unwrap();
    let c = cache.get_folder(&inline_key("compile:a", "cc")).unwrap();
    assert_ne!(a.id(), b.id());
    assert_ne!(a.id(), c.id());
    assert_ne!(b.id(), c.id());
}

#[test]
fn contended_folder_lock_times_out_as_retryable() {
    let temp = TempDir::new().unwrap();
    let key = inline_key("compile:slow", "x");

    // One holder keeps the folder locked past the other's timeout
    let (hold_tx, hold_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder_dir = temp.path().to_path_buf();
    let holder_key = key.clone();
    let holder = thread::spawn(move || {
        let cache = Cache::new(
            &holder_dir.join("cache"),
            &holder_dir.join("cache").join("index.sqlite"),
            Duration::from_secs(2),
        );
        let folder = cache.get_folder(&holder_key).unwrap();
        hold_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        drop(folder);
    });

    hold_rx.recv().unwrap();
    let cache = cache_at(&temp, Duration::from_millis(200));
    let err = match cache.get_folder(&key) {
        Ok(_) => panic!("the folder lock is still held"),
        Err(err) => err,
    };
    assert!(matches!(err, CacheError::LockTimeout(_)));
    assert!(err.is_retryable());

    // The top-level mapping marks it retryable with exit code 2
    let top: GraderError = err.into();
    assert!(top.is_retryable());
    assert_eq!(top.exit_code(), 2);

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    // Once released, the same key is obtainable again
    assert!(cache.get_folder(&key).is_ok());
}

#[test]
fn path_content_change_invalidates_without_new_folder() {
    let temp = TempDir::new().unwrap();
    let cache = cache_at(&temp, Duration::from_secs(2));
    let limits = ExecutionLimits::default();

    let src = temp.path().join("gen.sh");
    fs::write(&src, "echo v1").unwrap();
    let descr = FileDescriptor::at_path("gen.sh", src.to_str().unwrap());

    let key = |descr: &FileDescriptor| {
        let mut builder = CacheKeyBuilder::new("compile:gen", &limits);
        builder.file(descr, Some(&src)).unwrap();
        builder.finish()
    };

    let id = {
        let mut folder = cache.get_folder(&key(&descr)).unwrap();
        folder.write_file("gen.exe", b"v1").unwrap();
        folder.mark_complete().unwrap();
        folder.id()
    };

    fs::write(&src, "echo v2").unwrap();
    let folder = cache.get_folder(&key(&descr)).unwrap();
    assert_eq!(folder.id(), id);
    assert!(!folder.is_complete());
    assert!(!folder.path().join("gen.exe").exists());
}
