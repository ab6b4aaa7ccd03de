use shardnet_core::error::{codes, CoreError, ErrorCategory};
use shardnet_core::Result;

use crate::output_stream::BufferedOutputStream;

/// A logical message header is a list of NV pairs, each tagged by a small byte.
/// Encoding the header is left to whichever layer emits it — here, since the
/// buffered stream is what actually lays the bytes down.
#[derive(Clone, Debug, PartialEq)]
pub enum NvValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
}

const TAG_BOOL: u8 = 0;
const TAG_I32: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_BYTES: u8 = 4;

/// Writes `count` as a `u16` followed by each `(tag, value)` pair.
pub fn write_nv_pairs(stream: &mut BufferedOutputStream, pairs: &[(u8, NvValue)]) {
    assert!(pairs.len() <= u16::MAX as usize, "too many NV pairs for a u16 count");
    stream.write_bulk(&(pairs.len() as u16).to_be_bytes());
    for (tag, value) in pairs {
        stream.write_byte(*tag);
        match value {
            NvValue::Bool(b) => {
                stream.write_byte(TAG_BOOL);
                stream.write_bool(*b);
            }
            NvValue::I32(v) => {
                stream.write_byte(TAG_I32);
                stream.write_i32(*v);
            }
            NvValue::I64(v) => {
                stream.write_byte(TAG_I64);
                stream.write_i64(*v);
            }
            NvValue::Str(v) => {
                stream.write_byte(TAG_STR);
                stream.write_str(Some(v));
            }
            NvValue::Bytes(v) => {
                stream.write_byte(TAG_BYTES);
                stream.write_bulk(&(v.len() as u32).to_be_bytes());
                stream.write_bulk(v);
            }
        }
    }
}

/// Decodes a flat NV-pair header previously written by [`write_nv_pairs`]. Unknown tags
/// abort decode rather than being skipped, so
/// a version mismatch is never silently tolerated.
pub fn read_nv_pairs(buf: &[u8]) -> Result<Vec<(u8, NvValue)>> {
    let mut cursor = Cursor { buf, pos: 0 };
    let count = cursor.read_u16()? as usize;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_tag = cursor.read_u8()?;
        let value_tag = cursor.read_u8()?;
        let value = match value_tag {
            TAG_BOOL => NvValue::Bool(cursor.read_u8()? != 0),
            TAG_I32 => NvValue::I32(cursor.read_i32()?),
            TAG_I64 => NvValue::I64(cursor.read_i64()?),
            TAG_STR => NvValue::Str(cursor.read_str()?),
            TAG_BYTES => NvValue::Bytes(cursor.read_bytes()?),
            other => {
                return Err(CoreError::new(
                    codes::WIRE_UNKNOWN_NV_TAG,
                    ErrorCategory::Protocol,
                    format!("unknown NV value tag {other}"),
                ))
            }
        };
        pairs.push((name_tag, value));
    }
    Ok(pairs)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(truncated());
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_str(&mut self) -> Result<String> {
        let is_non_null = self.read_u8()? != 0;
        if !is_non_null {
            return Ok(String::new());
        }
        let chooser = self.read_u8()?;
        if chooser == 0 {
            let len = self.read_u16()? as usize;
            let bytes = self.take(len)?;
            String::from_utf8(bytes.to_vec()).map_err(|err| {
                CoreError::new(codes::WIRE_UNKNOWN_NV_TAG, ErrorCategory::Protocol, "invalid utf-8")
                    .with_cause(err)
            })
        } else {
            let unit_count = self.read_i32()? as usize;
            let mut units = Vec::with_capacity(unit_count);
            for _ in 0..unit_count {
                units.push(self.read_u16()?);
            }
            String::from_utf16(&units).map_err(|err| {
                CoreError::new(codes::WIRE_UNKNOWN_NV_TAG, ErrorCategory::Protocol, "invalid utf-16")
                    .with_cause(err)
            })
        }
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_i32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn truncated() -> CoreError {
    CoreError::new(
        codes::WIRE_UNKNOWN_NV_TAG,
        ErrorCategory::Protocol,
        "NV pair header truncated",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardnet_buffer::BlockPool;

    #[test]
    fn nv_pairs_round_trip() {
        let pool = BlockPool::new(16);
        let mut stream = BufferedOutputStream::new(pool, 64, 512);
        let pairs = vec![
            (1u8, NvValue::Bool(true)),
            (2u8, NvValue::I32(42)),
            (3u8, NvValue::Str("session".into())),
            (4u8, NvValue::Bytes(vec![9, 8, 7])),
        ];
        write_nv_pairs(&mut stream, &pairs);
        let flat = stream.clone_written_bytes();
        let decoded = read_nv_pairs(&flat).expect("decode");
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn unknown_tag_aborts_decode() {
        let buf = [0u8, 1, 5, 99]; // count=1, name_tag=5, value_tag=99 (unknown)
        let err = read_nv_pairs(&buf).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }
}
