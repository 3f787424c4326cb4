//! Archive writer: sequential member streams into one artifact file.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::checksum::StreamingHasher;
use crate::manifest::Compression;

use super::{ARCHIVE_FORMAT, ARCHIVE_MAGIC, CHUNK_SIZE, FLAG_GZIP, MEMBER_MAGIC, TRAILER_MAGIC};

/// What the writer learned about one finished member.
#[derive(Debug, Clone)]
pub struct MemberStats {
    /// Bytes as stored in the archive (post-compression).
    pub stored_bytes: u64,
    /// Hex SHA-256 of the stored bytes; this is the manifest checksum.
    pub checksum: String,
}

pub struct ArchiveWriter {
    out: BufWriter<File>,
    compression: Compression,
    gzip_level: u32,
    member_count: u32,
    finished: bool,
}

impl ArchiveWriter {
    pub fn create(path: &Path, compression: Compression, gzip_level: u32) -> Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create archive {}", path.display()))?;
        let mut out = BufWriter::new(f);

        out.write_all(ARCHIVE_MAGIC)?;
        out.write_u32::<LittleEndian>(ARCHIVE_FORMAT)?;
        let flags = match compression {
            Compression::Gzip => FLAG_GZIP,
            Compression::None => 0,
        };
        out.write_u32::<LittleEndian>(flags)?;

        Ok(Self {
            out,
            compression,
            gzip_level,
            member_count: 0,
            finished: false,
        })
    }

    /// Open the next member stream. The previous member must have been
    /// finished; members are strictly sequential.
    pub fn begin_member(&mut self, name: &str) -> Result<MemberWriter<'_>> {
        if name.len() > u16::MAX as usize {
            return Err(anyhow!("member name too long: {name}"));
        }
        self.out.write_all(MEMBER_MAGIC)?;
        self.out.write_u16::<LittleEndian>(name.len() as u16)?;
        self.out.write_all(name.as_bytes())?;
        self.member_count += 1;

        let sink = ChunkSink {
            out: &mut self.out,
            buf: Vec::with_capacity(CHUNK_SIZE),
            crc: crc32fast::Hasher::new(),
            sha: StreamingHasher::new(),
        };
        Ok(match self.compression {
            Compression::None => MemberWriter::Plain(sink),
            Compression::Gzip => {
                MemberWriter::Gzip(GzEncoder::new(sink, GzLevel::new(self.gzip_level)))
            }
        })
    }

    /// Write the trailer and flush. Without this call the archive is
    /// structurally invalid on purpose: a crashed writer leaves no
    /// readable artifact behind.
    pub fn finish(mut self) -> Result<u32> {
        self.out.write_all(TRAILER_MAGIC)?;
        self.out.write_u32::<LittleEndian>(self.member_count)?;
        self.out.flush()?;
        self.out.get_ref().sync_all().context("sync archive")?;
        self.finished = true;
        Ok(self.member_count)
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if !self.finished {
            // No trailer was written; the artifact is unreadable and the
            // orchestrator deletes the whole temp directory.
            log::warn!("archive writer dropped without finish(); artifact left without trailer");
        }
    }
}

/// Chunk-framing sink: buffers payload bytes and emits length-prefixed
/// chunks, tracking CRC and SHA-256 of everything stored.
pub struct ChunkSink<'a> {
    out: &'a mut BufWriter<File>,
    buf: Vec<u8>,
    crc: crc32fast::Hasher,
    sha: StreamingHasher,
}

impl ChunkSink<'_> {
    fn flush_chunk(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.out.write_u32::<LittleEndian>(self.buf.len() as u32)?;
        self.out.write_all(&self.buf)?;
        self.crc.update(&self.buf);
        self.sha.update(&self.buf);
        self.buf.clear();
        Ok(())
    }

    fn finish(mut self) -> Result<MemberStats> {
        self.flush_chunk()?;
        self.out.write_u32::<LittleEndian>(0)?;
        let stored_bytes = self.sha.bytes_seen();
        self.out.write_u32::<LittleEndian>(self.crc.finalize())?;
        Ok(MemberStats {
            stored_bytes,
            checksum: self.sha.finish_hex(),
        })
    }
}

impl Write for ChunkSink<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = CHUNK_SIZE - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == CHUNK_SIZE {
                self.flush_chunk()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // Partial chunks are only emitted on member finish; flushing here
        // would break the fixed chunk framing.
        Ok(())
    }
}

/// One member's write handle; plain or gzip-wrapped.
pub enum MemberWriter<'a> {
    Plain(ChunkSink<'a>),
    Gzip(GzEncoder<ChunkSink<'a>>),
}

impl MemberWriter<'_> {
    /// Close the member: flush compression, emit the terminator and CRC.
    pub fn finish(self) -> Result<MemberStats> {
        match self {
            MemberWriter::Plain(sink) => sink.finish(),
            MemberWriter::Gzip(gz) => gz.finish().context("finish gzip member")?.finish(),
        }
    }
}

impl Write for MemberWriter<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match self {
            MemberWriter::Plain(s) => s.write(data),
            MemberWriter::Gzip(g) => g.write(data),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            MemberWriter::Plain(s) => s.flush(),
            MemberWriter::Gzip(g) => g.flush(),
        }
    }
}
