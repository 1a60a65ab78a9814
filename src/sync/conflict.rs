//! Conflicts detected during a sync run.
//!
//! A conflict is a destination entry the run was not allowed to change:
//! it has no source counterpart and deletion is off, or its kind differs
//! from the source entry. Conflicts are reported, never resolved
//! automatically.

use std::fmt;

use crate::sync::error::SyncError;
use crate::sync::unit::UnitKind;

/// Why a destination entry could not be synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Source no longer has the entry and deletion is disabled.
    SourceMissing,
    /// Both sides exist with different kinds.
    TypeMismatch,
}

impl ConflictReason {
    pub fn description(&self) -> &'static str {
        match self {
            Self::SourceMissing => "exists in destination but not in source",
            Self::TypeMismatch => "already exists with a different type",
        }
    }
}

/// One conflict, keyed by the path relative to the sync roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    pub source_kind: UnitKind,
    pub dest_kind: UnitKind,
    pub reason: ConflictReason,
}

impl Conflict {
    pub fn new(
        path: impl Into<String>,
        source_kind: UnitKind,
        dest_kind: UnitKind,
        reason: ConflictReason,
    ) -> Self {
        Self {
            path: path.into(),
            source_kind,
            dest_kind,
            reason,
        }
    }

    /// Error value reported through the run log.
    pub fn to_error(&self) -> SyncError {
        let reason = match self.reason {
            ConflictReason::SourceMissing => {
                format!("{} exists but cannot sync, deletion is disabled", self.dest_kind)
            }
            ConflictReason::TypeMismatch => format!(
                "{} already exists with different type {}",
                self.source_kind, self.dest_kind
            ),
        };
        SyncError::Conflict {
            path: self.path.clone(),
            reason,
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason.description())
    }
}

/// Per-reason conflict counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConflictStats {
    pub source_missing: usize,
    pub type_mismatch: usize,
}

impl ConflictStats {
    pub fn from_conflicts(conflicts: &[Conflict]) -> Self {
        let mut stats = Self::default();
        for conflict in conflicts {
            match conflict.reason {
                ConflictReason::SourceMissing => stats.source_missing += 1,
                ConflictReason::TypeMismatch => stats.type_mismatch += 1,
            }
        }
        stats
    }

    pub fn total(&self) -> usize {
        self.source_missing + self.type_mismatch
    }
}
