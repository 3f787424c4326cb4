//! Framed archive container for snapshot artifacts.
//!
//! One file holds every named member (tables/<name>.dat, media/<path>).
//! Layout:
//! - header:  [magic "SVAR"][format u32][flags u32]   (flag bit0 = gzip members)
//! - member:  [magic "SMBR"][name_len u16][name utf-8]
//!            [chunk len u32][chunk bytes] ... [0u32 terminator]
//!            [crc32 u32 of the stored payload]
//! - trailer: [magic "SEND"][member_count u32]
//!
//! Chunked framing lets members of unknown length stream through with a
//! fixed buffer. Gzip (when enabled) wraps each member payload
//! independently; the stored (possibly compressed) bytes are what member
//! checksums in the manifest refer to.
//!
//! Structural problems (bad magic, torn chunk, missing trailer, frame CRC)
//! raise ArchiveCorruptError — a different failure class from a manifest
//! checksum mismatch.

mod reader;
mod writer;

pub use reader::{ArchiveReader, MemberDigest, MemberEntry, RawPayload};
pub use writer::{ArchiveWriter, MemberStats, MemberWriter};

pub(crate) const ARCHIVE_MAGIC: &[u8; 4] = b"SVAR";
pub(crate) const MEMBER_MAGIC: &[u8; 4] = b"SMBR";
pub(crate) const TRAILER_MAGIC: &[u8; 4] = b"SEND";

pub(crate) const ARCHIVE_FORMAT: u32 = 1;
pub(crate) const FLAG_GZIP: u32 = 1 << 0;

/// Chunk size for member payload framing.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;
