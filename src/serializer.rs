//! Table serialization: rows to/from an archive member stream.
//!
//! Frame per row: [payload_len u32][crc32 u32][payload], payload =
//! [field_count u16][field]... (see value.rs for the field codec).
//! Clean EOF between frames ends the table; a torn frame, CRC mismatch or
//! undecodable field raises SerializationError{table,row_index,field} and
//! aborts the run. Rows are never skipped silently.
//!
//! Both directions stream: one row frame in memory at a time.

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::errors::SerializationError;
use crate::value::{Row, Value};

/// Upper bound on one encoded row; anything larger is treated as a
/// corrupted frame instead of an allocation attempt.
const MAX_ROW_BYTES: u32 = 256 * 1024 * 1024;

fn ser_err(table: &str, row_index: u64, field: usize, detail: impl Into<String>) -> anyhow::Error {
    SerializationError {
        table: table.to_string(),
        row_index,
        field,
        detail: detail.into(),
    }
    .into()
}

/// Stream rows into `w`. Returns the number of rows written.
pub fn serialize_rows<W, I>(table: &str, rows: I, w: &mut W) -> Result<u64>
where
    W: Write,
    I: Iterator<Item = Result<Row>>,
{
    let mut payload = Vec::new();
    let mut count: u64 = 0;

    for row in rows {
        let row = row?;
        payload.clear();
        if row.len() > u16::MAX as usize {
            return Err(ser_err(table, count, 0, "too many fields in row"));
        }
        payload.write_u16::<LittleEndian>(row.len() as u16)?;
        for (i, v) in row.iter().enumerate() {
            v.encode(&mut payload)
                .map_err(|e| ser_err(table, count, i, e.to_string()))?;
        }
        if payload.len() as u64 > MAX_ROW_BYTES as u64 {
            return Err(ser_err(table, count, 0, "encoded row exceeds frame limit"));
        }

        let mut crc = crc32fast::Hasher::new();
        crc.update(&payload);

        w.write_u32::<LittleEndian>(payload.len() as u32)?;
        w.write_u32::<LittleEndian>(crc.finalize())?;
        w.write_all(&payload)?;
        count += 1;
    }
    Ok(count)
}

/// Lazy row decoder over a member stream.
pub struct RowDecoder<R: Read> {
    r: R,
    table: String,
    row_index: u64,
    done: bool,
}

impl<R: Read> RowDecoder<R> {
    pub fn new(table: impl Into<String>, r: R) -> Self {
        Self {
            r,
            table: table.into(),
            row_index: 0,
            done: false,
        }
    }

    /// Read exactly 4 bytes or detect a clean end-of-stream.
    fn read_frame_len(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            let n = self.r.read(&mut buf[got..])?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return Err(ser_err(
                    &self.table,
                    self.row_index,
                    0,
                    "torn row frame header",
                ));
            }
            got += n;
        }
        Ok(Some(LittleEndian::read_u32(&buf)))
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let len = match self.read_frame_len()? {
            Some(l) => l,
            None => {
                self.done = true;
                return Ok(None);
            }
        };
        if len > MAX_ROW_BYTES {
            return Err(ser_err(
                &self.table,
                self.row_index,
                0,
                format!("row frame length {len} out of range"),
            ));
        }
        let expected_crc = self
            .r
            .read_u32::<LittleEndian>()
            .map_err(|_| ser_err(&self.table, self.row_index, 0, "torn row frame crc"))?;

        let mut payload = vec![0u8; len as usize];
        self.r
            .read_exact(&mut payload)
            .map_err(|_| ser_err(&self.table, self.row_index, 0, "torn row payload"))?;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&payload);
        if crc.finalize() != expected_crc {
            return Err(ser_err(&self.table, self.row_index, 0, "row crc mismatch"));
        }

        let mut rd = &payload[..];
        let field_count = rd
            .read_u16::<LittleEndian>()
            .map_err(|_| ser_err(&self.table, self.row_index, 0, "truncated field count"))?;
        let mut row = Vec::with_capacity(field_count as usize);
        for i in 0..field_count as usize {
            let v = Value::decode(&mut rd)
                .map_err(|e| ser_err(&self.table, self.row_index, i, e.to_string()))?;
            row.push(v);
        }
        if !rd.is_empty() {
            return Err(ser_err(
                &self.table,
                self.row_index,
                field_count as usize,
                "trailing bytes after last field",
            ));
        }

        self.row_index += 1;
        Ok(Some(row))
    }
}

impl<R: Read> Iterator for RowDecoder<R> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(e) => {
                // Decode errors are terminal for the run; stop iterating.
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
