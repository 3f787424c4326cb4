//! Row value model and its binary field codec.
//!
//! The engine never interprets business data; it only needs an encoding
//! whose round-trip is exact. In particular:
//! - NULL, empty string and zero are distinct values;
//! - decimals carry mantissa+scale, not a float approximation;
//! - timestamps are a UTC-normalized instant plus the original UTC offset.
//!
//! Field wire format (little-endian):
//!   [tag u8][payload]
//!   tag 0 Null       — no payload
//!   tag 1 Bool       — u8 (0|1)
//!   tag 2 Int        — i64
//!   tag 3 Float      — f64 bits (bit-exact, NaN included)
//!   tag 4 Decimal    — scale u32 + mantissa i128 (16 bytes LE)
//!   tag 5 Text       — len u32 + UTF-8 bytes
//!   tag 6 Bytes      — len u32 + raw bytes
//!   tag 7 Timestamp  — unix_micros i64 + offset_secs i32

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal { mantissa: i128, scale: u32 },
    Text(String),
    Bytes(Vec<u8>),
    Timestamp { unix_micros: i64, offset_secs: i32 },
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_DECIMAL: u8 = 4;
const TAG_TEXT: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_TIMESTAMP: u8 = 7;

impl Value {
    /// UTC-normalized timestamp constructor: the instant is given in the
    /// local frame, the offset is recorded and subtracted out.
    pub fn timestamp_with_offset(local_micros: i64, offset_secs: i32) -> Self {
        Value::Timestamp {
            unix_micros: local_micros - (offset_secs as i64) * 1_000_000,
            offset_secs,
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Value::Null => w.write_u8(TAG_NULL)?,
            Value::Bool(b) => {
                w.write_u8(TAG_BOOL)?;
                w.write_u8(if *b { 1 } else { 0 })?;
            }
            Value::Int(v) => {
                w.write_u8(TAG_INT)?;
                w.write_i64::<LittleEndian>(*v)?;
            }
            Value::Float(v) => {
                w.write_u8(TAG_FLOAT)?;
                w.write_u64::<LittleEndian>(v.to_bits())?;
            }
            Value::Decimal { mantissa, scale } => {
                w.write_u8(TAG_DECIMAL)?;
                w.write_u32::<LittleEndian>(*scale)?;
                w.write_all(&mantissa.to_le_bytes())?;
            }
            Value::Text(s) => {
                w.write_u8(TAG_TEXT)?;
                w.write_u32::<LittleEndian>(s.len() as u32)?;
                w.write_all(s.as_bytes())?;
            }
            Value::Bytes(b) => {
                w.write_u8(TAG_BYTES)?;
                w.write_u32::<LittleEndian>(b.len() as u32)?;
                w.write_all(b)?;
            }
            Value::Timestamp {
                unix_micros,
                offset_secs,
            } => {
                w.write_u8(TAG_TIMESTAMP)?;
                w.write_i64::<LittleEndian>(*unix_micros)?;
                w.write_i32::<LittleEndian>(*offset_secs)?;
            }
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Value> {
        let tag = r.read_u8()?;
        let v = match tag {
            TAG_NULL => Value::Null,
            TAG_BOOL => match r.read_u8()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(anyhow!("bad bool byte {}", other)),
            },
            TAG_INT => Value::Int(r.read_i64::<LittleEndian>()?),
            TAG_FLOAT => Value::Float(f64::from_bits(r.read_u64::<LittleEndian>()?)),
            TAG_DECIMAL => {
                let scale = r.read_u32::<LittleEndian>()?;
                let mut buf = [0u8; 16];
                r.read_exact(&mut buf)?;
                Value::Decimal {
                    mantissa: i128::from_le_bytes(buf),
                    scale,
                }
            }
            TAG_TEXT => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf)?;
                Value::Text(String::from_utf8(buf).map_err(|e| anyhow!("bad utf-8 text: {e}"))?)
            }
            TAG_BYTES => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf)?;
                Value::Bytes(buf)
            }
            TAG_TIMESTAMP => Value::Timestamp {
                unix_micros: r.read_i64::<LittleEndian>()?,
                offset_secs: r.read_i32::<LittleEndian>()?,
            },
            other => return Err(anyhow!("unknown value tag {}", other)),
        };
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_empty_zero_are_distinct() {
        let vals = [
            Value::Null,
            Value::Text(String::new()),
            Value::Int(0),
            Value::Bytes(Vec::new()),
        ];
        let mut buf = Vec::new();
        for v in &vals {
            v.encode(&mut buf).unwrap();
        }
        let mut rd = &buf[..];
        for v in &vals {
            assert_eq!(&Value::decode(&mut rd).unwrap(), v);
        }
    }

    #[test]
    fn timestamp_normalizes_to_utc() {
        // 2h east of UTC: local instant minus offset is the UTC instant.
        let v = Value::timestamp_with_offset(7_200_000_000, 7_200);
        assert_eq!(
            v,
            Value::Timestamp {
                unix_micros: 0,
                offset_secs: 7_200
            }
        );
    }
}
