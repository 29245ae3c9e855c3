use uuid::Uuid;

use crate::error::{Result, SaveError};

/// Little-endian cursor over an owned, resizable byte buffer.
///
/// Reads never grow the buffer and fail with [`SaveError::BufferUnderflow`]
/// past the end. Overwrites stay within the current length; changing the
/// length is always an explicit [`ByteBuffer::insert_bytes`] or
/// [`ByteBuffer::remove_bytes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    bytes: Vec<u8>,
    pos: usize,
}

impl ByteBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn seek_to(&mut self, pos: usize) -> Result<()> {
        if pos > self.bytes.len() {
            return Err(SaveError::BufferUnderflow {
                offset: pos,
                needed: 0,
                len: self.bytes.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(SaveError::BufferUnderflow {
                offset: self.pos,
                needed: n,
                len: self.bytes.len(),
            })?;
        let start = self.pos;
        self.pos = end;
        Ok(&self.bytes[start..end])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.take_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Booleans occupy two bytes; any nonzero value is true.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u16()? != 0)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Length-prefixed string. A negative length means UTF-16 code units, a
    /// positive one UTF-8 bytes; both counts include the trailing NUL.
    pub fn read_string(&mut self) -> Result<String> {
        let start = self.pos;
        let len = self.read_i32()?;
        if len == 0 {
            return Ok(String::new());
        }

        if len < 0 {
            let units = len.unsigned_abs() as usize;
            let bytes = self.take(units.saturating_mul(2))?;
            let mut code_units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            if code_units.pop() != Some(0) {
                return Err(SaveError::invalid(format!(
                    "UTF-16 string at offset {start} is missing its terminator"
                )));
            }
            String::from_utf16(&code_units).map_err(|e| {
                SaveError::invalid(format!("invalid UTF-16 string at offset {start}: {e}"))
            })
        } else {
            let bytes = self.take(len as usize)?;
            let (terminator, body) = bytes
                .split_last()
                .ok_or_else(|| SaveError::invalid("empty string payload"))?;
            if *terminator != 0 {
                return Err(SaveError::invalid(format!(
                    "string at offset {start} is missing its terminator"
                )));
            }
            String::from_utf8(body.to_vec()).map_err(|e| {
                SaveError::invalid(format!("invalid UTF-8 string at offset {start}: {e}"))
            })
        }
    }

    pub fn peek_u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.bytes.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrite bytes in place. The buffer length never changes.
    pub fn overwrite(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.bytes.len())
            .ok_or(SaveError::BufferUnderflow {
                offset,
                needed: data.len(),
                len: self.bytes.len(),
            })?;
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn overwrite_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.overwrite(offset, &value.to_le_bytes())
    }

    /// Splice `data` in at `offset`. A cursor at or past `offset` moves with
    /// the bytes it was pointing at.
    pub fn insert_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset > self.bytes.len() {
            return Err(SaveError::BufferUnderflow {
                offset,
                needed: 0,
                len: self.bytes.len(),
            });
        }
        self.bytes.splice(offset..offset, data.iter().copied());
        if self.pos >= offset {
            self.pos += data.len();
        }
        Ok(())
    }

    /// Remove `len` bytes starting at `offset`.
    pub fn remove_bytes(&mut self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(SaveError::BufferUnderflow {
                offset,
                needed: len,
                len: self.bytes.len(),
            })?;
        self.bytes.drain(offset..end);
        if self.pos >= end {
            self.pos -= len;
        } else if self.pos > offset {
            self.pos = offset;
        }
        Ok(())
    }
}

/// Append-only little-endian encoder, the write side of [`ByteBuffer`].
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    out: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.out
    }

    pub fn position(&self) -> usize {
        self.out.len()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u16(u16::from(v));
    }

    pub fn write_uuid(&mut self, id: &Uuid) {
        self.out.extend_from_slice(id.as_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        if s.is_empty() {
            self.write_i32(0);
        } else if s.is_ascii() {
            self.write_i32(s.len() as i32 + 1);
            self.out.extend_from_slice(s.as_bytes());
            self.out.push(0);
        } else {
            let units: Vec<u16> = s.encode_utf16().collect();
            self.write_i32(-(units.len() as i32 + 1));
            for unit in units {
                self.write_u16(unit);
            }
            self.write_u16(0);
        }
    }

    /// Backfill a u32 written earlier, e.g. a size field whose value is only
    /// known once the payload is out.
    pub fn patch_u32(&mut self, offset: usize, v: u32) -> Result<()> {
        let len = self.out.len();
        let slot = self
            .out
            .get_mut(offset..offset + 4)
            .ok_or(SaveError::BufferUnderflow {
                offset,
                needed: 4,
                len,
            })?;
        slot.copy_from_slice(&v.to_le_bytes());
        Ok(())
    }
}

/// Encoded length of [`ByteWriter::write_string`] for `s`.
pub fn encoded_string_len(s: &str) -> usize {
    if s.is_empty() {
        4
    } else if s.is_ascii() {
        4 + s.len() + 1
    } else {
        4 + (s.encode_utf16().count() + 1) * 2
    }
}
