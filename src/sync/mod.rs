//! Directory mirroring.
//!
//! Compares a source tree against a destination tree entry by entry and
//! applies the creates, updates and deletes that make the destination
//! converge to the source, preserving ownership, mode and times.

pub mod compression;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod exclude;
pub mod hash;
pub mod path_utils;
pub mod report;
pub mod unit;

pub use compression::{CompressionLevel, ContainerReader, ContainerWriter, ContentReader, ContentWriter};
pub use conflict::{Conflict, ConflictReason, ConflictStats};
pub use engine::{HandledPathIndex, SyncConfig, SyncEngine, SyncOptions, SyncReport, SyncStats};
pub use error::{Result, SyncError};
pub use exclude::{FilterRule, FilterSet};
pub use hash::{hash_bytes, hash_reader, ContentHash, ContentHasher};
pub use report::{BarProgress, LogLevel, MemoryLog, NoProgress, ProgressReporter, RunLog, SyncLog};
pub use unit::{DiffFlags, Unit, UnitKind};
