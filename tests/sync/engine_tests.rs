// Tests for the two-pass sync engine
// Each test builds a source and destination tree in temp dirs and runs a full sync

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use sqsync::sync::{
    ConflictReason, FilterSet, LogLevel, MemoryLog, ProgressReporter, SyncConfig, SyncEngine,
    SyncLog, SyncOptions, SyncReport,
};

use crate::{mode_of, run_sync, set_mode, write_file};

fn build_tree(root: &Path) {
    write_file(&root.join("readme.txt"), b"top level file");
    write_file(&root.join("docs/guide.md"), &b"a longer document body\n".repeat(40));
    write_file(&root.join("docs/nested/deep.txt"), b"deep");
    fs::create_dir_all(root.join("empty")).unwrap();
    symlink("docs/guide.md", root.join("guide-link")).unwrap();
}

#[test]
fn test_new_directory_and_file_are_created() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let file = src.path().join("a/file.txt");
    write_file(&file, b"hello from a");
    set_mode(&file, 0o644);

    let (report, _log) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert_eq!(report.errors, 0);
    assert!(dst.path().join("a").is_dir());
    assert_eq!(fs::read(dst.path().join("a/file.txt")).unwrap(), b"hello from a");
    assert_eq!(mode_of(&dst.path().join("a/file.txt")), 0o644);
    assert_eq!(report.stats.dirs_created, 1);
    assert_eq!(report.stats.files_copied, 1);
}

#[test]
fn test_second_run_is_idempotent() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    build_tree(src.path());

    let (first, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());
    assert_eq!(first.errors, 0);
    assert_eq!(first.stats.files_copied, 3);
    assert_eq!(first.stats.links_created, 1);
    assert_eq!(first.stats.dirs_created, 3);

    let (second, log) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());
    assert_eq!(second.errors, 0);
    assert_eq!(second.stats.changes(), 0, "unexpected actions: {:?}", log.entries());
}

#[test]
fn test_second_run_is_idempotent_without_hashing() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    build_tree(src.path());
    let options = SyncOptions {
        skip_hash: true,
        ..Default::default()
    };

    run_sync(src.path(), dst.path(), options, FilterSet::new());
    let (second, log) = run_sync(src.path(), dst.path(), options, FilterSet::new());

    assert_eq!(second.stats.changes(), 0, "unexpected actions: {:?}", log.entries());
}

#[test]
fn test_compressed_copy_is_idempotent() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    build_tree(src.path());
    let options = SyncOptions {
        compress: true,
        ..Default::default()
    };

    let (first, _) = run_sync(src.path(), dst.path(), options, FilterSet::new());
    assert_eq!(first.errors, 0);

    let (second, log) = run_sync(src.path(), dst.path(), options, FilterSet::new());
    assert_eq!(second.errors, 0);
    assert_eq!(second.stats.changes(), 0, "unexpected actions: {:?}", log.entries());
}

#[test]
fn test_changed_content_is_recopied() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("data.txt"), b"version one");

    run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());
    write_file(&src.path().join("data.txt"), b"version two");
    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(fs::read(dst.path().join("data.txt")).unwrap(), b"version two");
}

#[test]
fn test_missing_source_without_delete_is_a_conflict() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&dst.path().join("b.txt"), b"only in destination");

    let (report, log) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert!(dst.path().join("b.txt").exists());
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].path, "b.txt");
    assert_eq!(report.conflicts[0].reason, ConflictReason::SourceMissing);
    assert_eq!(report.errors, 1);
    assert!(log.contains("exists but cannot sync"));
}

#[test]
fn test_delete_removes_children_before_parents() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("keep.txt"), b"keep");
    write_file(&dst.path().join("old/x/y.txt"), b"y");
    write_file(&dst.path().join("old/z.txt"), b"z");
    let options = SyncOptions {
        delete: true,
        ..Default::default()
    };

    let (report, log) = run_sync(src.path(), dst.path(), options, FilterSet::new());

    assert_eq!(report.errors, 0, "{:?}", log.entries());
    assert!(!dst.path().join("old").exists());
    assert_eq!(report.stats.entries_deleted, 4);
    assert!(dst.path().join("keep.txt").exists());

    let deletions: Vec<&str> = log
        .messages(LogLevel::Verbose)
        .into_iter()
        .filter(|m| m.starts_with("Deleted"))
        .collect();
    let position = |needle: &str| deletions.iter().position(|m| m.ends_with(needle)).unwrap();
    assert!(position("'old/x/y.txt'") < position("'old/x'"));
    assert!(position("'old/x'") < position("'old'"));
    assert!(position("'old/z.txt'") < position("'old'"));
}

#[test]
fn test_type_mismatch_without_delete_is_left_alone() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("thing/inner.txt"), b"inner");
    write_file(&dst.path().join("thing"), b"a file, not a directory");

    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert!(dst.path().join("thing").is_file());
    assert_eq!(fs::read(dst.path().join("thing")).unwrap(), b"a file, not a directory");
    assert!(report
        .conflicts
        .iter()
        .any(|c| c.path == "thing" && c.reason == ConflictReason::TypeMismatch));
    // Nothing below the conflicting entry is attempted.
    assert_eq!(report.errors, 1);
}

#[test]
fn test_type_mismatch_below_file_is_reported() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("f"), b"source file");
    write_file(&dst.path().join("f/c"), b"child");

    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert!(dst.path().join("f/c").is_file());
    assert_eq!(report.conflicts.len(), 2);
    assert_eq!(report.errors, 2);
}

#[test]
fn test_type_mismatch_with_delete_is_replaced() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("thing/inner.txt"), b"inner");
    write_file(&dst.path().join("thing"), b"stale file");
    write_file(&src.path().join("was-dir"), b"now a file");
    write_file(&dst.path().join("was-dir/leftover.txt"), b"leftover");
    let options = SyncOptions {
        delete: true,
        ..Default::default()
    };

    let (report, log) = run_sync(src.path(), dst.path(), options, FilterSet::new());

    assert_eq!(report.errors, 0, "{:?}", log.entries());
    assert_eq!(fs::read(dst.path().join("thing/inner.txt")).unwrap(), b"inner");
    assert_eq!(fs::read(dst.path().join("was-dir")).unwrap(), b"now a file");
}

#[test]
fn test_dry_run_changes_nothing() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("new/file.txt"), b"new");
    write_file(&dst.path().join("extra.txt"), b"extra");
    let options = SyncOptions {
        dry_run: true,
        delete: true,
        ..Default::default()
    };

    let (report, log) = run_sync(src.path(), dst.path(), options, FilterSet::new());

    assert!(report.dry_run);
    assert!(!dst.path().join("new").exists());
    assert!(dst.path().join("extra.txt").exists());
    assert_eq!(report.stats.dirs_created, 1);
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(report.stats.entries_deleted, 1);
    assert!(log.contains("Would copy 'new/file.txt'"));
    assert!(log.contains("Would delete file 'extra.txt'"));
}

#[test]
fn test_mode_drift_is_fixed_without_copy() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let a = src.path().join("script.sh");
    let b = dst.path().join("script.sh");
    write_file(&a, b"#!/bin/sh\necho hi\n");
    write_file(&b, b"#!/bin/sh\necho hi\n");
    set_mode(&a, 0o755);
    set_mode(&b, 0o644);

    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert_eq!(report.stats.permissions_fixed, 1);
    assert_eq!(report.stats.files_copied, 0);
    assert_eq!(mode_of(&b), 0o755);
}

#[test]
fn test_skip_mode_leaves_mode_drift() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let a = src.path().join("data");
    let b = dst.path().join("data");
    write_file(&a, b"same");
    write_file(&b, b"same");
    set_mode(&a, 0o640);
    set_mode(&b, 0o600);
    let options = SyncOptions {
        skip_mode: true,
        ..Default::default()
    };

    let (report, _) = run_sync(src.path(), dst.path(), options, FilterSet::new());

    assert_eq!(report.stats.changes(), 0);
    assert_eq!(mode_of(&b), 0o600);
}

#[test]
fn test_link_target_is_updated() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    symlink("first", src.path().join("current")).unwrap();

    run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());
    assert_eq!(fs::read_link(dst.path().join("current")).unwrap(), Path::new("first"));

    fs::remove_file(src.path().join("current")).unwrap();
    symlink("second", src.path().join("current")).unwrap();
    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert_eq!(report.errors, 0);
    assert_eq!(report.stats.links_created, 1);
    assert_eq!(fs::read_link(dst.path().join("current")).unwrap(), Path::new("second"));
}

#[test]
fn test_links_are_not_followed() {
    let src = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&outside.path().join("secret.txt"), b"outside the tree");
    symlink(outside.path(), src.path().join("escape")).unwrap();

    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert_eq!(report.errors, 0);
    assert!(fs::symlink_metadata(dst.path().join("escape")).unwrap().file_type().is_symlink());
    assert_eq!(report.stats.files_copied, 0);
}

#[test]
fn test_type_conflict_on_link_does_not_write_through_it() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    write_file(&src.path().join("x/secret.txt"), b"secret data");
    symlink(outside.path(), dst.path().join("x")).unwrap();

    let (report, log) = run_sync(src.path(), dst.path(), SyncOptions::default(), FilterSet::new());

    assert!(!outside.path().join("secret.txt").exists());
    assert!(fs::symlink_metadata(dst.path().join("x")).unwrap().file_type().is_symlink());
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].reason, ConflictReason::TypeMismatch);
    assert_eq!(report.errors, 1, "{:?}", log.entries());
    assert_eq!(report.stats.files_copied, 0);
}

#[test]
fn test_link_replaced_by_directory_with_delete() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    write_file(&src.path().join("x/secret.txt"), b"secret data");
    symlink(outside.path(), dst.path().join("x")).unwrap();
    let options = SyncOptions {
        delete: true,
        ..Default::default()
    };

    let (report, log) = run_sync(src.path(), dst.path(), options, FilterSet::new());

    assert_eq!(report.errors, 0, "{:?}", log.entries());
    assert!(fs::symlink_metadata(dst.path().join("x")).unwrap().is_dir());
    assert_eq!(fs::read(dst.path().join("x/secret.txt")).unwrap(), b"secret data");
    assert!(!outside.path().join("secret.txt").exists());
}

#[test]
fn test_source_link_is_not_resolved_during_delete() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    write_file(&outside.path().join("child.txt"), b"same bytes");
    symlink(outside.path(), src.path().join("x")).unwrap();
    write_file(&dst.path().join("x/child.txt"), b"same bytes");
    let options = SyncOptions {
        delete: true,
        ..Default::default()
    };

    let (report, log) = run_sync(src.path(), dst.path(), options, FilterSet::new());

    assert_eq!(report.errors, 0, "{:?}", log.entries());
    assert_eq!(report.stats.entries_deleted, 2);
    assert!(fs::symlink_metadata(dst.path().join("x")).unwrap().file_type().is_symlink());
    assert_eq!(fs::read(outside.path().join("child.txt")).unwrap(), b"same bytes");
}

/// Runs a filesystem action when a copy starts or stops.
struct CopyHook {
    path: PathBuf,
    on_start: fn(&Path),
    on_stop: fn(&Path),
}

impl ProgressReporter for CopyHook {
    fn start(&mut self, _total: u64, _label: &str) {
        (self.on_start)(&self.path);
    }

    fn update(&mut self, _done: u64) {}

    fn stop(&mut self) {
        (self.on_stop)(&self.path);
    }
}

fn run_with_hook(src: &Path, dst: &Path, mut hook: CopyHook) -> (SyncReport, MemoryLog) {
    let config = SyncConfig::new(src, dst, SyncOptions::default(), FilterSet::new()).unwrap();
    let mut log = MemoryLog::new();
    let report = SyncEngine::new(config, &mut log, &mut hook).run().unwrap();
    (report, log)
}

#[test]
fn test_short_copy_is_an_error_and_keeps_partial_file() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let file = src.path().join("shrinking.txt");
    write_file(&file, b"0123456789");

    // The source shrinks after it was probed and opened.
    let hook = CopyHook {
        path: file,
        on_start: |path| {
            fs::OpenOptions::new()
                .write(true)
                .open(path)
                .unwrap()
                .set_len(4)
                .unwrap()
        },
        on_stop: |_| {},
    };
    let (report, log) = run_with_hook(src.path(), dst.path(), hook);

    assert_eq!(report.errors, 1);
    assert_eq!(log.error_count(), 1);
    assert!(log.contains("wrote 4 of 10 bytes"), "{:?}", log.entries());
    assert_eq!(report.stats.files_copied, 0);
    assert_eq!(fs::read(dst.path().join("shrinking.txt")).unwrap(), b"0123");
}

#[test]
fn test_failed_permission_copy_keeps_content() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let file = src.path().join("vanishing.txt");
    write_file(&file, b"copied before the source vanished");

    // Without a source there is nothing to take ownership and mode from.
    let hook = CopyHook {
        path: file,
        on_start: |_| {},
        on_stop: |path| fs::remove_file(path).unwrap(),
    };
    let (report, log) = run_with_hook(src.path(), dst.path(), hook);

    assert_eq!(report.errors, 1);
    assert!(log.contains("Failed to change permissions on 'vanishing.txt'"), "{:?}", log.entries());
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(
        fs::read(dst.path().join("vanishing.txt")).unwrap(),
        b"copied before the source vanished"
    );
}
