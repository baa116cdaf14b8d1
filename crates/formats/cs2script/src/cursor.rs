//! Big-endian byte cursor and writer for script blobs.

use crate::error::{Error, Result};

/// Reads big-endian values from a borrowed buffer, tracking the offset for
/// error reports.
#[derive(Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::at(data, 0)
    }

    /// A cursor over `data` starting at `offset`.
    pub fn at(data: &'a [u8], offset: usize) -> Self {
        Self { data, pos: offset }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn rest(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn at_end(&self) -> bool {
        self.rest() == 0
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let have = self.rest();
        let Some(bytes) = self.data.get(self.pos..self.pos + N) else {
            return Err(Error::UnexpectedEof {
                offset: self.pos,
                need: N,
                have,
            });
        };
        self.pos += N;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.take::<1>().map(|[b]| b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.take().map(u16::from_be_bytes)
    }

    /// Unsigned 24-bit value, used by the tribyte immediate.
    pub fn read_u24(&mut self) -> Result<u32> {
        let [a, b, c] = self.take()?;
        Ok(u32::from_be_bytes([0, a, b, c]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.take().map(i32::from_be_bytes)
    }

    /// Two u32 halves, upper half first. Same layout as a big-endian i64.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.take().map(i64::from_be_bytes)
    }

    /// Null-terminated latin1 string.
    pub fn read_cstring(&mut self) -> Result<String> {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        let Some(end) = rest.iter().position(|&b| b == 0) else {
            return Err(Error::UnexpectedEof {
                offset: self.pos,
                need: rest.len() + 1,
                have: rest.len(),
            });
        };
        // every latin1 byte is the code point of the same value
        let s = rest[..end].iter().map(|&b| char::from(b)).collect();
        self.pos += end + 1;
        Ok(s)
    }
}

/// Growable big-endian output buffer.
#[derive(Default)]
pub struct Writer {
    out: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            out: Vec::with_capacity(bytes),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    /// Low 24 bits; the top byte is dropped.
    pub fn write_u24(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes()[1..]);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_be_bytes());
    }

    /// Characters outside latin1 become `?`.
    pub fn write_cstring(&mut self, s: &str) {
        self.out
            .extend(s.chars().map(|c| u8::try_from(c).unwrap_or(b'?')));
        self.out.push(0);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}
