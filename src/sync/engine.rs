//! Sync engine for one-way directory mirroring.
//!
//! A run makes two sequential passes over the relative path space:
//!
//! 1. The delete pass walks the destination children-first. Entries the
//!    source no longer has are deleted (or reported as conflicts), so a
//!    directory is only removed after everything below it.
//! 2. The sync pass walks the source parents-first and creates or updates
//!    whatever differs, so a directory exists before its children are
//!    copied into it.
//!
//! Paths settled by either pass are recorded in a [`HandledPathIndex`] and
//! never looked at again during the run.

use jwalk::WalkDir;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rustix::fs::{access, Access};

use crate::sync::conflict::{Conflict, ConflictReason, ConflictStats};
use crate::sync::error::{Result, SyncError};
use crate::sync::exclude::FilterSet;
use crate::sync::path_utils::{relative_path, split_parent};
use crate::sync::report::{ProgressReporter, SyncLog};
use crate::sync::unit::{DiffFlags, Unit, UnitKind};

/// Bytes moved per read/write during a file copy.
pub const COPY_CHUNK_SIZE: usize = 16 * 1024;

/// Files up to this size are never written as containers.
pub const COMPRESS_THRESHOLD: u64 = 256;

/// Run options, all off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Remove destination entries the source no longer has.
    pub delete: bool,
    /// Log what would change without touching the destination.
    pub dry_run: bool,
    pub quiet: bool,
    /// Skip the confirmation prompt.
    pub assume_yes: bool,
    /// Write copied files as containers.
    pub compress: bool,
    /// Compare files by size and mtime instead of content hash.
    pub skip_hash: bool,
    /// Ignore entries whose only difference is ownership or mode.
    pub skip_mode: bool,
}

/// Validated roots plus everything else a run needs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub options: SyncOptions,
    pub filters: FilterSet,
}

impl SyncConfig {
    /// Canonicalize and check both roots.
    ///
    /// Both must be readable directories, the destination must be writable,
    /// and neither may contain the other.
    pub fn new(
        source: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        options: SyncOptions,
        filters: FilterSet,
    ) -> Result<Self> {
        let source_root = validate_root("Source", source.as_ref(), false)?;
        let dest_root = validate_root("Destination", dest.as_ref(), true)?;

        if dest_root.starts_with(&source_root) || source_root.starts_with(&dest_root) {
            return Err(SyncError::InvalidRoot {
                role: "Destination",
                path: dest_root,
                reason: format!("overlaps the source '{}'", source_root.display()),
            });
        }

        Ok(Self {
            source_root,
            dest_root,
            options,
            filters,
        })
    }
}

fn validate_root(role: &'static str, path: &Path, writable: bool) -> Result<PathBuf> {
    let invalid = |reason: String| SyncError::InvalidRoot {
        role,
        path: path.to_path_buf(),
        reason,
    };

    let canonical = path
        .canonicalize()
        .map_err(|e| invalid(format!("cannot be resolved: {}", e)))?;
    if !canonical.is_dir() {
        return Err(invalid("is not a directory".to_string()));
    }
    if access(canonical.as_path(), Access::READ_OK | Access::EXEC_OK).is_err() {
        return Err(invalid("is not readable".to_string()));
    }
    if writable && access(canonical.as_path(), Access::WRITE_OK).is_err() {
        return Err(invalid("is not writable".to_string()));
    }
    Ok(canonical)
}

/// Relative paths already settled in the current run, grouped by parent.
#[derive(Debug, Default)]
pub struct HandledPathIndex {
    entries: HashMap<String, HashSet<String>>,
}

impl HandledPathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, relative: &str) {
        let (parent, name) = split_parent(relative);
        self.entries
            .entry(parent.to_string())
            .or_default()
            .insert(name.to_string());
    }

    pub fn contains(&self, relative: &str) -> bool {
        let (parent, name) = split_parent(relative);
        self.entries
            .get(parent)
            .is_some_and(|names| names.contains(name))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Entries compared (after filtering).
    pub entries_checked: usize,
    pub files_copied: usize,
    pub dirs_created: usize,
    pub links_created: usize,
    pub entries_deleted: usize,
    /// Entries where only ownership/mode was fixed.
    pub permissions_fixed: usize,
    pub conflicts: usize,
    pub bytes_written: u64,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        self.end_time = None;
    }

    pub fn stop(&mut self) {
        self.end_time = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Average write rate in bytes per second.
    pub fn rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes_written as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Number of mutating actions performed (or planned, in a dry run).
    pub fn changes(&self) -> usize {
        self.files_copied
            + self.dirs_created
            + self.links_created
            + self.entries_deleted
            + self.permissions_fixed
    }
}

/// Outcome of a finished run.
#[derive(Debug)]
pub struct SyncReport {
    pub stats: SyncStats,
    pub conflicts: Vec<Conflict>,
    pub errors: usize,
    pub warnings: usize,
    pub dry_run: bool,
}

impl SyncReport {
    pub fn conflict_stats(&self) -> ConflictStats {
        ConflictStats::from_conflicts(&self.conflicts)
    }

    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.warnings == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Delete,
    Sync,
}

fn walker(root: &Path) -> WalkDir {
    WalkDir::new(root)
        .parallelism(jwalk::Parallelism::Serial)
        .skip_hidden(false)
        .follow_links(false)
        .sort(true)
}

fn remove_entry(unit: &Unit) -> Result<()> {
    let result = match unit.kind() {
        UnitKind::Directory => fs::remove_dir(unit.path()),
        _ => fs::remove_file(unit.path()),
    };
    result.map_err(|e| SyncError::from_io_error(e, "removing", unit.path()))
}

/// Drives one run. Owns the run state, borrows the log and progress sinks.
pub struct SyncEngine<'a> {
    config: SyncConfig,
    handled: HandledPathIndex,
    log: &'a mut dyn SyncLog,
    progress: &'a mut dyn ProgressReporter,
    stats: SyncStats,
    conflicts: Vec<Conflict>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        config: SyncConfig,
        log: &'a mut dyn SyncLog,
        progress: &'a mut dyn ProgressReporter,
    ) -> Self {
        Self {
            config,
            handled: HandledPathIndex::new(),
            log,
            progress,
            stats: SyncStats::new(),
            conflicts: Vec::new(),
        }
    }

    /// Run both passes.
    ///
    /// Per-path failures are logged and counted; only roots that have
    /// disappeared since validation abort the run.
    pub fn run(mut self) -> Result<SyncReport> {
        for (role, root) in [
            ("Source", &self.config.source_root),
            ("Destination", &self.config.dest_root),
        ] {
            if !root.is_dir() {
                return Err(SyncError::InvalidRoot {
                    role,
                    path: root.clone(),
                    reason: "is no longer a directory".to_string(),
                });
            }
        }

        self.stats.start();
        if self.config.options.dry_run {
            self.log.info("Dry run, the destination will not be modified");
        }

        self.delete_pass();
        self.sync_pass();

        self.stats.stop();
        tracing::debug!(
            "Run finished in {:?}, {} path(s) handled",
            self.stats.elapsed(),
            self.handled.len()
        );

        Ok(SyncReport {
            errors: self.log.error_count(),
            warnings: self.log.warning_count(),
            dry_run: self.config.options.dry_run,
            stats: self.stats,
            conflicts: self.conflicts,
        })
    }

    fn delete_pass(&mut self) {
        let root = self.config.dest_root.clone();
        let mut paths = Vec::new();
        for entry_result in walker(&root) {
            match entry_result {
                Ok(entry) => match relative_path(&root, &entry.path()) {
                    Some(relative) if !relative.is_empty() => paths.push(relative),
                    _ => {}
                },
                Err(e) => self.log.error(&format!("Error walking destination: {}", e)),
            }
        }

        // Sorted pre-order reversed: every entry comes before its parent.
        for relative in paths.iter().rev() {
            self.visit(relative, Pass::Delete);
        }
    }

    fn sync_pass(&mut self) {
        let root = self.config.source_root.clone();
        for entry_result in walker(&root) {
            match entry_result {
                Ok(entry) => match relative_path(&root, &entry.path()) {
                    Some(relative) if !relative.is_empty() => self.visit(&relative, Pass::Sync),
                    _ => {}
                },
                Err(e) => self.log.error(&format!("Error walking source: {}", e)),
            }
        }
    }

    fn visit(&mut self, relative: &str, pass: Pass) {
        if self.handled.contains(relative) {
            return;
        }
        if self.config.filters.is_excluded_tree(relative) {
            tracing::debug!("Excluded '{}'", relative);
            return;
        }
        self.stats.entries_checked += 1;

        let probed = Unit::probe_in(&self.config.source_root, relative).and_then(|src| {
            Unit::probe_in(&self.config.dest_root, relative).map(|dst| (src, dst))
        });
        let (src, dst) = match probed {
            Ok(units) => units,
            Err(e) => {
                self.log.write_error(&e);
                self.handled.mark(relative);
                return;
            }
        };

        if !src.exists() {
            if dst.exists() {
                if self.config.options.delete {
                    self.delete(relative, &dst);
                } else {
                    self.report_conflict(Conflict::new(
                        relative,
                        src.kind(),
                        dst.kind(),
                        ConflictReason::SourceMissing,
                    ));
                }
            } else {
                self.log
                    .info(&format!("Skipping '{}': not present on either side", relative));
            }
            self.handled.mark(relative);
            return;
        }

        let diff = match src.compare(&dst, !self.config.options.skip_hash) {
            Ok(diff) => diff,
            Err(e) => {
                self.log.write_error(&e);
                self.handled.mark(relative);
                return;
            }
        };
        tracing::debug!("Checking '{}': {:?}", relative, diff);

        if diff.is_empty() {
            return;
        }

        if diff == DiffFlags::MODE {
            if !self.config.options.skip_mode {
                self.fix_permissions(relative, &src, &dst);
                self.handled.mark(relative);
            }
            return;
        }

        // An unresolved type conflict keeps the whole subtree out of the run.
        if diff.contains(DiffFlags::TYPE) && dst.exists() {
            match (pass, self.config.options.delete) {
                (_, false) => {
                    self.report_conflict(Conflict::new(
                        relative,
                        src.kind(),
                        dst.kind(),
                        ConflictReason::TypeMismatch,
                    ));
                    self.handled.mark(relative);
                    self.config.filters.suppress_subtree(relative);
                    return;
                }
                // Clear the way; the sync pass recreates the entry.
                (Pass::Delete, true) => {
                    if !self.delete(relative, &dst) {
                        self.handled.mark(relative);
                        self.config.filters.suppress_subtree(relative);
                    }
                    return;
                }
                (Pass::Sync, true) => {}
            }
        }

        if pass == Pass::Delete {
            return;
        }

        self.handled.mark(relative);
        self.sync_entry(relative, &src, &dst);
    }

    /// Remove a destination entry. Returns false if removal failed.
    fn delete(&mut self, relative: &str, dst: &Unit) -> bool {
        if self.config.options.dry_run {
            self.log
                .info(&format!("Would delete {} '{}'", dst.kind(), relative));
            self.stats.entries_deleted += 1;
            return true;
        }

        match remove_entry(dst) {
            Ok(()) => {
                self.log.info(&format!("Deleted {} '{}'", dst.kind(), relative));
                self.stats.entries_deleted += 1;
                true
            }
            Err(e) => {
                self.log.write_error(&e);
                false
            }
        }
    }

    fn report_conflict(&mut self, conflict: Conflict) {
        self.log.write_error(&conflict.to_error());
        self.stats.conflicts += 1;
        self.conflicts.push(conflict);
    }

    fn fix_permissions(&mut self, relative: &str, src: &Unit, dst: &Unit) {
        if self.config.options.dry_run {
            self.log
                .info(&format!("Would fix permissions of '{}'", relative));
            self.stats.permissions_fixed += 1;
            return;
        }

        if self.propagate_permissions(relative, src, dst) {
            self.log.info(&format!("Fixed permissions of '{}'", relative));
            self.stats.permissions_fixed += 1;
        }
    }

    fn propagate_permissions(&mut self, relative: &str, src: &Unit, dst: &Unit) -> bool {
        match src.touch(dst) {
            Ok(()) => true,
            Err(e) => {
                let error = SyncError::PermissionPropagation {
                    path: relative.to_string(),
                };
                self.log.error(&format!("{}: {}", error, e));
                false
            }
        }
    }

    fn sync_entry(&mut self, relative: &str, src: &Unit, dst: &Unit) {
        let dry_run = self.config.options.dry_run;

        match src.kind() {
            UnitKind::Link => {
                let target = src.link_target().unwrap_or(Path::new("")).to_path_buf();
                if dry_run {
                    self.log.info(&format!(
                        "Would link '{}' -> '{}'",
                        relative,
                        target.display()
                    ));
                    self.stats.links_created += 1;
                    return;
                }
                if dst.exists() {
                    if let Err(e) = remove_entry(dst) {
                        self.log.write_error(&e);
                        return;
                    }
                }
                if let Err(e) = symlink(&target, dst.path()) {
                    self.log
                        .write_error(&SyncError::from_io_error(e, "creating link", dst.path()));
                    return;
                }
                self.log
                    .info(&format!("Linked '{}' -> '{}'", relative, target.display()));
                self.stats.links_created += 1;
            }
            UnitKind::Directory => {
                if dry_run {
                    self.log
                        .info(&format!("Would create directory '{}'", relative));
                    self.stats.dirs_created += 1;
                    return;
                }
                if let Err(e) = fs::create_dir(dst.path()) {
                    self.log.write_error(&SyncError::from_io_error(
                        e,
                        "creating directory",
                        dst.path(),
                    ));
                    self.config.filters.suppress_subtree(relative);
                    return;
                }
                self.log.info(&format!("Created directory '{}'", relative));
                self.stats.dirs_created += 1;
            }
            UnitKind::RegularFile => {
                if dry_run {
                    self.log.info(&format!(
                        "Would copy '{}' ({} bytes)",
                        relative,
                        src.size()
                    ));
                    self.stats.files_copied += 1;
                    return;
                }
                match self.copy_file(relative, src, dst) {
                    Ok(written) => {
                        self.log
                            .info(&format!("Copied '{}' ({} bytes)", relative, written));
                        self.stats.files_copied += 1;
                    }
                    Err(e) => {
                        self.log.write_error(&e);
                        return;
                    }
                }
            }
            UnitKind::Virtual => return,
        }

        match Unit::probe(dst.path()) {
            Ok(created) => {
                self.propagate_permissions(relative, src, &created);
            }
            Err(e) => self.log.write_error(&e),
        }
    }

    /// Stream the source content into the destination.
    ///
    /// A short copy leaves the partial destination file in place.
    fn copy_file(&mut self, relative: &str, src: &Unit, dst: &Unit) -> Result<u64> {
        if !src.is_readable() {
            return Err(SyncError::PermissionDenied {
                path: src.path().to_path_buf(),
                operation: "reading".to_string(),
            });
        }
        if !dst.is_writable() {
            return Err(SyncError::PermissionDenied {
                path: dst.path().to_path_buf(),
                operation: "writing".to_string(),
            });
        }

        let expected = src.size();
        let compress = self.config.options.compress && expected > COMPRESS_THRESHOLD;
        let known_hash = if compress { src.hash()? } else { None };

        let mut reader = src.open_reader()?;
        let mut writer = dst.open_writer(compress, known_hash.as_ref(), Some(expected))?;
        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut written = 0u64;

        self.progress.start(expected, relative);
        let outcome = loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(SyncError::from_io_error(e, "reading", src.path())),
            };
            if let Err(e) = writer.write_all(&buffer[..bytes_read]) {
                break Err(SyncError::from_io_error(e, "writing", dst.path()));
            }
            written += bytes_read as u64;
            self.progress.update(written);
        };
        self.progress.stop();
        outcome?;

        writer
            .finish()
            .map_err(|e| SyncError::from_io_error(e, "finishing", dst.path()))?;
        self.stats.bytes_written += written;

        if written != expected {
            return Err(SyncError::ShortCopy {
                path: relative.to_string(),
                written,
                expected,
            });
        }
        Ok(written)
    }
}
