//! Content hashing for sync comparisons.
//!
//! Provides the 128-bit MD5 digest used to detect content changes and
//! embedded into compressed containers.

use md5::{Digest as Md5Digest, Md5};
use std::fmt;
use std::io::{self, Read};

/// Size of a content digest in bytes (128 bits).
pub const HASH_LEN: usize = 16;

/// Read buffer used while hashing a stream.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// A computed content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Wrap raw digest bytes.
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a digest from a slice, `None` unless it is exactly [`HASH_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher, fed chunk by chunk.
#[derive(Default)]
pub struct ContentHasher(Md5);

impl ContentHasher {
    pub fn new() -> Self {
        Self(Md5::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        Md5Digest::update(&mut self.0, data);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(Md5Digest::finalize(self.0).into())
    }
}

/// Hash bytes in memory.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Hash a stream to its end, returning the digest and the number of bytes read.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(ContentHash, u64)> {
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((hasher.finalize(), total))
}
