// Library module for sqsync
// Re-exports the sync engine for the binary and integration tests

pub mod sync;
