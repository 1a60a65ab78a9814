// Tests for exclude filters applied during a sync run

use std::fs;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

use sqsync::sync::{FilterSet, SyncOptions};

use crate::{run_sync, write_file};

#[test]
fn test_node_modules_are_not_copied() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("app.js"), b"console.log(1)");
    write_file(&src.path().join("node_modules/pkg/index.js"), b"module.exports = {}");
    write_file(&src.path().join("lib/node_modules/x.js"), b"x");
    let filters = FilterSet::from_patterns(&["**/node_modules/**"]).unwrap();

    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), filters);

    assert_eq!(report.errors, 0);
    assert!(dst.path().join("app.js").exists());
    assert!(dst.path().join("lib").is_dir());
    assert!(!dst.path().join("node_modules").exists());
    assert!(!dst.path().join("lib/node_modules").exists());
}

#[test]
fn test_excluded_destination_entries_survive_delete() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&dst.path().join("cache/keep.bin"), b"local cache");
    write_file(&dst.path().join("stale.txt"), b"stale");
    let filters = FilterSet::from_patterns(&["cache/"]).unwrap();
    let options = SyncOptions {
        delete: true,
        ..Default::default()
    };

    let (report, _) = run_sync(src.path(), dst.path(), options, filters);

    assert_eq!(report.errors, 0);
    assert!(dst.path().join("cache/keep.bin").exists());
    assert!(!dst.path().join("stale.txt").exists());
}

#[test]
fn test_regex_directory_rule_hides_subtree() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("build/out/app.bin"), b"binary");
    write_file(&src.path().join("src/main.c"), b"int main() {}");
    let filters = FilterSet::from_patterns(&["rx:^build$"]).unwrap();

    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), filters);

    assert_eq!(report.errors, 0);
    assert!(!dst.path().join("build").exists());
    assert!(dst.path().join("src/main.c").exists());
}

#[test]
fn test_filter_file_rules() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("notes.txt"), b"keep");
    write_file(&src.path().join("notes.txt.swp"), b"editor swap");
    write_file(&src.path().join("logs/today.log"), b"log line");

    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# editor files").unwrap();
    writeln!(file, "*.swp").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "rx:\\.log$").unwrap();

    let mut filters = FilterSet::new();
    filters.add_argument(file.path().to_str().unwrap()).unwrap();
    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), filters);

    assert_eq!(report.errors, 0);
    assert!(dst.path().join("notes.txt").exists());
    assert!(!dst.path().join("notes.txt.swp").exists());
    assert!(dst.path().join("logs").is_dir());
    assert_eq!(fs::read_dir(dst.path().join("logs")).unwrap().count(), 0);
}

#[test]
fn test_filter_file_globs_apply_at_any_depth() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(&src.path().join("app.log"), b"top log");
    write_file(&src.path().join("logs/today.log"), b"nested log");
    write_file(&src.path().join("web/node_modules/pkg/index.js"), b"dependency");
    write_file(&src.path().join("web/index.js"), b"app");

    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "*.log").unwrap();
    writeln!(file, "node_modules").unwrap();

    let mut filters = FilterSet::new();
    filters.add_argument(file.path().to_str().unwrap()).unwrap();
    let (report, _) = run_sync(src.path(), dst.path(), SyncOptions::default(), filters);

    assert_eq!(report.errors, 0);
    assert!(!dst.path().join("app.log").exists());
    assert!(!dst.path().join("logs/today.log").exists());
    assert!(!dst.path().join("web/node_modules").exists());
    assert!(dst.path().join("web/index.js").exists());
}
