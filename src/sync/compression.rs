//! Compressed content container.
//!
//! A container is a gzip stream whose FEXTRA field carries a `Sq` subfield:
//! one version byte followed by the metadata block. The metadata block is a
//! sequence of tagged fields:
//!
//! - `0x06` followed by the 16-byte content digest, which lets a later run
//!   read the hash of a synced file without decompressing it
//! - `0x07` followed by the decompressed length as a little-endian `u64`
//!
//! Without a length field the decompressed length comes from the gzip ISIZE
//! trailer, which only holds it modulo 2^32.
//!
//! Plain gzip files without the subfield are not containers and are read
//! as raw content.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression as GzipCompression, GzBuilder};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::sync::error::{Result, SyncError};
use crate::sync::hash::{ContentHash, HASH_LEN};

/// Version written into the container subfield.
pub const CONTAINER_VERSION: u8 = 1;

/// Metadata tag for an embedded content digest.
pub const TAG_CONTENT_HASH: u8 = 0x06;

/// Metadata tag for the full decompressed length.
pub const TAG_CONTENT_LENGTH: u8 = 0x07;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_CM_DEFLATE: u8 = 8;
const GZIP_FEXTRA: u8 = 0x04;
const GZIP_FLAG_RESERVED: u8 = 0xe0;
const GZIP_HEADER_LEN: usize = 10;
const GZIP_TRAILER_LEN: u64 = 8;

/// Subfield ID identifying a sqsync container inside the gzip extra field.
const SUBFIELD_ID: [u8; 2] = *b"Sq";

/// Largest metadata block that fits in one extra subfield.
pub const MAX_HEADER_LEN: usize = u16::MAX as usize - 4 - 1;

/// Compression level (1-9, where 1 is fastest-lowest and 9 is slowest-highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

impl CompressionLevel {
    /// Create a new compression level (clamped to 1-9).
    pub fn new(level: u8) -> Self {
        Self(level.clamp(1, 9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Build a metadata block from the fields that are known.
pub fn metadata_block(hash: Option<&ContentHash>, length: Option<u64>) -> Vec<u8> {
    let mut block = Vec::new();
    if let Some(hash) = hash {
        block.push(TAG_CONTENT_HASH);
        block.extend_from_slice(hash.as_bytes());
    }
    if let Some(length) = length {
        block.push(TAG_CONTENT_LENGTH);
        block.extend_from_slice(&length.to_le_bytes());
    }
    block
}

/// Build the metadata block that embeds a content digest.
pub fn hash_block(hash: &ContentHash) -> Vec<u8> {
    metadata_block(Some(hash), None)
}

fn field_len(tag: u8) -> Option<usize> {
    match tag {
        TAG_CONTENT_HASH => Some(HASH_LEN),
        TAG_CONTENT_LENGTH => Some(8),
        _ => None,
    }
}

/// Payload of the first `tag` field. Parsing stops at an unknown tag.
fn block_field(block: &[u8], tag: u8) -> Option<&[u8]> {
    let mut rest = block;
    while let Some((&current, tail)) = rest.split_first() {
        let len = field_len(current)?;
        if tail.len() < len {
            return None;
        }
        let (value, next) = tail.split_at(len);
        if current == tag {
            return Some(value);
        }
        rest = next;
    }
    None
}

/// Extract the digest from a metadata block, if it carries one.
pub fn hash_from_block(block: &[u8]) -> Option<ContentHash> {
    block_field(block, TAG_CONTENT_HASH).and_then(ContentHash::from_slice)
}

/// Extract the full decompressed length from a metadata block.
pub fn length_from_block(block: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = block_field(block, TAG_CONTENT_LENGTH)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Parse a gzip member header and return the container metadata block.
///
/// Returns `Ok(None)` for anything that is not a container, including short
/// files and gzip files written by other tools.
fn parse_header<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut fixed = [0u8; GZIP_HEADER_LEN];
    match reader.read_exact(&mut fixed) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let flags = fixed[3];
    if fixed[..2] != GZIP_MAGIC
        || fixed[2] != GZIP_CM_DEFLATE
        || flags & GZIP_FEXTRA == 0
        || flags & GZIP_FLAG_RESERVED != 0
    {
        return Ok(None);
    }

    let mut xlen = [0u8; 2];
    let mut extra = Vec::new();
    let read_extra = reader.read_exact(&mut xlen).and_then(|_| {
        extra.resize(u16::from_le_bytes(xlen) as usize, 0);
        reader.read_exact(&mut extra)
    });
    match read_extra {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = [extra[pos], extra[pos + 1]];
        let len = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let start = pos + 4;
        let end = start + len;
        if end > extra.len() {
            return Ok(None);
        }
        if id == SUBFIELD_ID {
            return Ok(match extra[start..end].split_first() {
                Some((&CONTAINER_VERSION, block)) => Some(block.to_vec()),
                _ => None,
            });
        }
        pos = end;
    }

    Ok(None)
}

/// Decompressing reader over a container.
pub struct ContainerReader<R: Read> {
    decoder: GzDecoder<R>,
    header: Vec<u8>,
    real_length: u64,
}

impl<R: Read + Seek> ContainerReader<R> {
    /// Sniff `inner` for a container.
    ///
    /// On a match the header and ISIZE trailer are read without touching the
    /// compressed payload. A length field in the header wins over ISIZE. Otherwise the reader is rewound and handed back so
    /// the caller can treat it as raw content.
    pub fn open(mut inner: R) -> io::Result<std::result::Result<Self, R>> {
        inner.seek(SeekFrom::Start(0))?;
        let header = parse_header(&mut inner)?;
        let total = inner.seek(SeekFrom::End(0))?;

        let header = match header {
            Some(header) if total >= GZIP_HEADER_LEN as u64 + GZIP_TRAILER_LEN => header,
            _ => {
                inner.seek(SeekFrom::Start(0))?;
                return Ok(Err(inner));
            }
        };

        inner.seek(SeekFrom::End(-4))?;
        let mut trailer = [0u8; 4];
        inner.read_exact(&mut trailer)?;
        inner.seek(SeekFrom::Start(0))?;

        let real_length =
            length_from_block(&header).unwrap_or(u32::from_le_bytes(trailer) as u64);
        Ok(Ok(Self {
            decoder: GzDecoder::new(inner),
            header,
            real_length,
        }))
    }
}

impl<R: Read> ContainerReader<R> {
    /// Raw metadata block bytes, empty when none was written.
    pub fn read_header(&self) -> &[u8] {
        &self.header
    }

    /// Decompressed payload size.
    pub fn real_length(&self) -> u64 {
        self.real_length
    }

    pub fn embedded_hash(&self) -> Option<ContentHash> {
        hash_from_block(&self.header)
    }
}

impl<R: Read> Read for ContainerReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(buf)
    }
}

/// Compressing writer producing a container.
///
/// The metadata block is fixed at construction, before any payload byte.
pub struct ContainerWriter<W: Write> {
    encoder: GzEncoder<W>,
}

impl<W: Write> ContainerWriter<W> {
    /// Create a container writer carrying `header` as its metadata block.
    pub fn with_header(inner: W, header: &[u8], level: CompressionLevel) -> io::Result<Self> {
        if header.len() > MAX_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("container header of {} bytes exceeds {}", header.len(), MAX_HEADER_LEN),
            ));
        }
        Ok(Self::build(inner, header, level))
    }

    fn build(inner: W, header: &[u8], level: CompressionLevel) -> Self {
        let data_len = (1 + header.len()) as u16;
        let mut extra = Vec::with_capacity(4 + data_len as usize);
        extra.extend_from_slice(&SUBFIELD_ID);
        extra.extend_from_slice(&data_len.to_le_bytes());
        extra.push(CONTAINER_VERSION);
        extra.extend_from_slice(header);

        let encoder = GzBuilder::new()
            .extra(extra)
            .write(inner, GzipCompression::new(level.value() as u32));
        Self { encoder }
    }

    /// Write the trailer and get the inner writer back.
    pub fn finish(self) -> io::Result<W> {
        self.encoder.finish()
    }
}

impl<W: Write> Write for ContainerWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

/// Reader over file content, transparently decompressing containers.
pub struct ContentReader<R: Read> {
    inner: ContentReaderInner<R>,
}

enum ContentReaderInner<R: Read> {
    Raw(R),
    Container(ContainerReader<R>),
}

impl<R: Read + Seek> ContentReader<R> {
    pub fn open(reader: R) -> io::Result<Self> {
        let inner = match ContainerReader::open(reader)? {
            Ok(container) => ContentReaderInner::Container(container),
            Err(raw) => ContentReaderInner::Raw(raw),
        };
        Ok(Self { inner })
    }
}

impl<R: Read> ContentReader<R> {
    pub fn is_container(&self) -> bool {
        matches!(self.inner, ContentReaderInner::Container(_))
    }

    /// Digest stored in the container header, if any.
    pub fn embedded_hash(&self) -> Option<ContentHash> {
        match &self.inner {
            ContentReaderInner::Container(c) => c.embedded_hash(),
            ContentReaderInner::Raw(_) => None,
        }
    }

    /// Decompressed length for containers, `None` for raw content.
    pub fn real_length(&self) -> Option<u64> {
        match &self.inner {
            ContentReaderInner::Container(c) => Some(c.real_length()),
            ContentReaderInner::Raw(_) => None,
        }
    }
}

impl<R: Read> Read for ContentReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ContentReaderInner::Raw(r) => r.read(buf),
            ContentReaderInner::Container(r) => r.read(buf),
        }
    }
}

/// Writer for file content, optionally wrapped in a container.
pub struct ContentWriter<W: Write> {
    inner: ContentWriterInner<W>,
}

enum ContentWriterInner<W: Write> {
    Raw(W),
    Container(ContainerWriter<W>),
}

impl<W: Write> ContentWriter<W> {
    pub fn raw(writer: W) -> Self {
        Self {
            inner: ContentWriterInner::Raw(writer),
        }
    }

    /// Wrap `writer` in a container, embedding `hash` and `length` when known.
    pub fn container(
        writer: W,
        hash: Option<&ContentHash>,
        length: Option<u64>,
        level: CompressionLevel,
    ) -> io::Result<Self> {
        let container = ContainerWriter::with_header(writer, &metadata_block(hash, length), level)?;
        Ok(Self {
            inner: ContentWriterInner::Container(container),
        })
    }

    pub fn is_container(&self) -> bool {
        matches!(self.inner, ContentWriterInner::Container(_))
    }

    /// Flush everything (including the container trailer) and get the inner writer back.
    pub fn finish(self) -> io::Result<W> {
        match self.inner {
            ContentWriterInner::Raw(mut w) => {
                w.flush()?;
                Ok(w)
            }
            ContentWriterInner::Container(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for ContentWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            ContentWriterInner::Raw(w) => w.write(buf),
            ContentWriterInner::Container(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            ContentWriterInner::Raw(w) => w.flush(),
            ContentWriterInner::Container(w) => w.flush(),
        }
    }
}

/// Read the metadata block and decompressed length of a container file.
pub fn inspect(path: &Path) -> Result<(Vec<u8>, u64)> {
    let file = File::open(path).map_err(|e| SyncError::from_io_error(e, "opening", path))?;
    match ContainerReader::open(file).map_err(|e| SyncError::from_io_error(e, "reading", path))? {
        Ok(container) => Ok((container.read_header().to_vec(), container.real_length())),
        Err(_) => Err(SyncError::NotAContainer {
            path: path.to_path_buf(),
        }),
    }
}
