//! Archive reader: sequential, streaming member access.
//!
//! Members must be consumed fully (read to EOF or drained) before the next
//! one is opened; the file position is the only cursor. Structural checks
//! happen in two places: open() validates header and trailer presence,
//! per-member CRC is verified when a member is consumed.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::checksum::StreamingHasher;
use crate::errors::ArchiveCorruptError;
use crate::manifest::Compression;

use super::{ARCHIVE_FORMAT, ARCHIVE_MAGIC, FLAG_GZIP, MEMBER_MAGIC, TRAILER_MAGIC};

const HEADER_LEN: u64 = 12;
const TRAILER_LEN: u64 = 8;

#[derive(Debug)]
pub struct ArchiveReader {
    r: BufReader<File>,
    pub compression: Compression,
    pub member_count: u32,
}

impl ArchiveReader {
    /// Open and structurally validate an archive: header magic/format and
    /// trailer presence. Content CRCs are checked as members are consumed.
    pub fn open(path: &Path) -> Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("open archive {}", path.display()))?;
        let len = f.metadata()?.len();
        if len < HEADER_LEN + TRAILER_LEN {
            return Err(ArchiveCorruptError(format!("archive too short ({} bytes)", len)).into());
        }
        let mut r = BufReader::new(f);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != ARCHIVE_MAGIC {
            return Err(ArchiveCorruptError("bad archive header magic".to_string()).into());
        }
        let format = r.read_u32::<LittleEndian>()?;
        if format != ARCHIVE_FORMAT {
            return Err(ArchiveCorruptError(format!("unsupported archive format {format}")).into());
        }
        let flags = r.read_u32::<LittleEndian>()?;
        let compression = if flags & FLAG_GZIP != 0 {
            Compression::Gzip
        } else {
            Compression::None
        };

        // Trailer check up front: a writer that crashed mid-run never wrote
        // one, and a truncated file lost it.
        r.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
        let mut tmagic = [0u8; 4];
        r.read_exact(&mut tmagic)?;
        if &tmagic != TRAILER_MAGIC {
            return Err(
                ArchiveCorruptError("missing or truncated archive trailer".to_string()).into(),
            );
        }
        let member_count = r.read_u32::<LittleEndian>()?;
        r.seek(SeekFrom::Start(HEADER_LEN))?;

        Ok(Self {
            r,
            compression,
            member_count,
        })
    }

    /// Read the next member header (name only); None at the trailer.
    fn read_member_header(&mut self) -> Result<Option<String>> {
        let mut magic = [0u8; 4];
        self.r
            .read_exact(&mut magic)
            .map_err(|_| ArchiveCorruptError("unexpected end of archive".to_string()))?;
        if &magic == TRAILER_MAGIC {
            return Ok(None);
        }
        if &magic != MEMBER_MAGIC {
            return Err(ArchiveCorruptError("bad member magic".to_string()).into());
        }
        let name_len = self
            .r
            .read_u16::<LittleEndian>()
            .map_err(|_| ArchiveCorruptError("torn member header".to_string()))?
            as usize;
        let mut name_buf = vec![0u8; name_len];
        self.r
            .read_exact(&mut name_buf)
            .map_err(|_| ArchiveCorruptError("torn member name".to_string()))?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| ArchiveCorruptError("member name is not utf-8".to_string()))?;
        Ok(Some(name))
    }

    /// Advance to the next member. The previous member must have been
    /// fully consumed.
    pub fn next_member(&mut self) -> Result<Option<MemberEntry<'_>>> {
        let name = match self.read_member_header()? {
            Some(n) => n,
            None => return Ok(None),
        };
        let compression = self.compression;
        Ok(Some(MemberEntry {
            name,
            compression,
            payload: RawPayload::new(&mut self.r),
        }))
    }

    /// Consume the reader and position it at `name`, returning an owned
    /// decoded-payload stream (for lazy per-table row iteration).
    pub fn into_member_reader(mut self, name: &str) -> Result<Box<dyn Read + Send>> {
        loop {
            match self.read_member_header()? {
                None => return Err(anyhow!("archive member not found: {name}")),
                Some(n) if n == name => {
                    let payload = RawPayload::new(self.r);
                    return Ok(match self.compression {
                        Compression::None => Box::new(payload),
                        Compression::Gzip => Box::new(GzDecoder::new(payload)),
                    });
                }
                Some(_) => {
                    RawPayload::new(&mut self.r).finish()?;
                }
            }
        }
    }

    /// Scan forward for `name` and copy its decoded (decompressed) payload
    /// into `out`. Members before it are drained in passing.
    pub fn extract_member_to<W: Write>(&mut self, name: &str, out: &mut W) -> Result<()> {
        while let Some(entry) = self.next_member()? {
            if entry.name == name {
                let mut data = entry.into_data_reader();
                std::io::copy(&mut data, out).with_context(|| format!("extract member {name}"))?;
                return Ok(());
            }
            entry.drain()?;
        }
        Err(anyhow!("archive member not found: {name}"))
    }
}

/// One member positioned for reading.
pub struct MemberEntry<'a> {
    pub name: String,
    compression: Compression,
    payload: RawPayload<&'a mut BufReader<File>>,
}

impl<'a> MemberEntry<'a> {
    /// Stored-bytes reader (no decompression); what checksums refer to.
    pub fn into_raw(self) -> RawPayload<&'a mut BufReader<File>> {
        self.payload
    }

    /// Decoded payload reader, decompressing if the archive is gzip.
    pub fn into_data_reader(self) -> Box<dyn Read + 'a> {
        match self.compression {
            Compression::None => Box::new(self.payload),
            Compression::Gzip => Box::new(GzDecoder::new(self.payload)),
        }
    }

    /// Consume the member entirely.
    pub fn drain(self) -> Result<MemberDigest> {
        self.into_raw().finish()
    }
}

/// What a fully consumed member looked like.
#[derive(Debug, Clone)]
pub struct MemberDigest {
    pub stored_bytes: u64,
    /// Hex SHA-256 of the stored bytes, for comparison with the manifest.
    pub hash_hex: String,
    /// Whether the member's frame CRC matched what was stored.
    pub crc_ok: bool,
}

/// Reader over one member's stored payload, chunk by chunk. Checks the
/// member CRC at the terminator and keeps a SHA-256 of everything read.
pub struct RawPayload<R: Read> {
    r: R,
    in_chunk: u32,
    done: bool,
    crc: crc32fast::Hasher,
    crc_ok: bool,
    sha: Option<StreamingHasher>,
    stored: u64,
    hash_hex: Option<String>,
}

impl<R: Read> RawPayload<R> {
    fn new(r: R) -> Self {
        Self {
            r,
            in_chunk: 0,
            done: false,
            crc: crc32fast::Hasher::new(),
            crc_ok: true,
            sha: Some(StreamingHasher::new()),
            stored: 0,
            hash_hex: None,
        }
    }

    fn corrupt(msg: &str) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("archive corrupt: {msg}"),
        )
    }

    fn advance_chunk(&mut self) -> std::io::Result<()> {
        debug_assert_eq!(self.in_chunk, 0);
        let len = self
            .r
            .read_u32::<LittleEndian>()
            .map_err(|_| Self::corrupt("torn chunk header"))?;
        if len == 0 {
            let expected = self
                .r
                .read_u32::<LittleEndian>()
                .map_err(|_| Self::corrupt("missing member crc"))?;
            // A CRC divergence is content corruption, not broken framing;
            // it is recorded and left to checksum verification to classify.
            self.crc_ok = self.crc.clone().finalize() == expected;
            if let Some(sha) = self.sha.take() {
                self.hash_hex = Some(sha.finish_hex());
            }
            self.done = true;
        } else {
            self.in_chunk = len;
        }
        Ok(())
    }

    /// Consume any remaining payload.
    pub fn finish(mut self) -> Result<MemberDigest> {
        let mut sink = [0u8; 8192];
        loop {
            let n = self
                .read(&mut sink)
                .map_err(|e| ArchiveCorruptError(e.to_string()))?;
            if n == 0 {
                break;
            }
        }
        let hash_hex = self
            .hash_hex
            .take()
            .ok_or_else(|| anyhow!("member payload not finished"))?;
        Ok(MemberDigest {
            stored_bytes: self.stored,
            hash_hex,
            crc_ok: self.crc_ok,
        })
    }
}

impl<R: Read> Read for RawPayload<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.done {
                return Ok(0);
            }
            if self.in_chunk == 0 {
                self.advance_chunk()?;
                continue;
            }
            if buf.is_empty() {
                return Ok(0);
            }
            let want = buf.len().min(self.in_chunk as usize);
            let n = self.r.read(&mut buf[..want])?;
            if n == 0 {
                return Err(Self::corrupt("torn chunk payload"));
            }
            self.crc.update(&buf[..n]);
            if let Some(sha) = self.sha.as_mut() {
                sha.update(&buf[..n]);
            }
            self.stored += n as u64;
            self.in_chunk -= n as u32;
            return Ok(n);
        }
    }
}
