//! Streaming content hashing (SHA-256, hex-encoded).
//!
//! Used twice: to record expected hashes at the end of a backup, and to
//! gate every restore before anything destructive happens. Constant memory
//! regardless of input size.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::io::Read;

const BUF_SIZE: usize = 64 * 1024;

/// Incremental hasher for code paths that produce bytes as they go
/// (archive writer, member verification).
pub struct StreamingHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    pub fn finish_hex(self) -> String {
        hex_encode(&self.inner.finalize())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash an entire stream with a fixed buffer.
pub fn compute<R: Read>(mut r: R) -> Result<String> {
    let mut h = StreamingHasher::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h.finish_hex())
}

/// Hash a stream and compare against an expected hex digest.
pub fn verify<R: Read>(r: R, expected_hex: &str) -> Result<bool> {
    let actual = compute(r)?;
    Ok(actual == expected_hex)
}

/// Aggregate checksum over a list of member digests: SHA-256 of the
/// concatenated hex strings, in manifest order.
pub fn aggregate(member_hashes: &[String]) -> String {
    let mut h = Sha256::new();
    for m in member_hashes {
        h.update(m.as_bytes());
    }
    hex_encode(&h.finalize())
}

pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
