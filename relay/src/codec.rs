//! Little-endian frame codec: a pair of cursors over fixed-size datagram buffers.
//!
//! `Reader` and `Writer` never own a buffer — they borrow one scratch buffer for the
//! lifetime of a single call into the relay engine. Datagram boundaries matter here, so
//! this is deliberately not a general streaming abstraction: one reader per received
//! datagram, one writer per staged outgoing datagram.

use byteorder::{ByteOrder, LittleEndian};

/// A NUL-terminated string ran off the end of the buffer without finding its terminator.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Truncated;

pub type CodecResult<T> = Result<T, Truncated>;

/// Cursor over a received datagram.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    /// Bytes left between the cursor and the end of the datagram.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reads a little-endian `i8`. The caller is expected to have checked `remaining()`
    /// first; this is a fixed-width read and an out-of-bounds call is a programming error.
    #[inline]
    pub fn read_i8(&mut self) -> i8 {
        assert!(self.remaining() >= 1, "read_i8 past end of buffer");
        let v = self.buf[self.pos] as i8;
        self.pos += 1;
        v
    }

    #[inline]
    pub fn read_i16(&mut self) -> i16 {
        assert!(self.remaining() >= 2, "read_i16 past end of buffer");
        let v = LittleEndian::read_i16(&self.buf[self.pos..]);
        self.pos += 2;
        v
    }

    #[inline]
    pub fn read_i32(&mut self) -> i32 {
        assert!(self.remaining() >= 4, "read_i32 past end of buffer");
        let v = LittleEndian::read_i32(&self.buf[self.pos..]);
        self.pos += 4;
        v
    }

    #[inline]
    pub fn read_u8(&mut self) -> u8 {
        self.read_i8() as u8
    }

    /// Returns the rest of the datagram as a single block and advances the cursor to the end.
    #[inline]
    pub fn read_rest(&mut self) -> &'a [u8] {
        let block = &self.buf[self.pos..];
        self.pos = self.buf.len();
        block
    }

    /// Reads up to `len` bytes, clamped to whatever is actually left (a short read, never
    /// an error - the caller asked for more than the datagram contained).
    #[inline]
    pub fn read_block(&mut self, len: usize) -> &'a [u8] {
        let take = len.min(self.remaining());
        let block = &self.buf[self.pos..self.pos + take];
        self.pos += take;
        block
    }

    /// Reads a NUL-terminated string, copying into `out` truncated to its capacity and
    /// always NUL-terminating `out` in the space that remains. The cursor always advances
    /// past the terminator it actually found, independent of how much fit in `out` - so a
    /// caller with a too-small buffer doesn't desync the fields that follow.
    pub fn read_cstr(&mut self, out: &mut [u8]) -> CodecResult<usize> {
        let rest = &self.buf[self.pos..];
        let nul_at = match rest.iter().position(|&b| b == 0) {
            Some(i) => i,
            None => return Err(Truncated),
        };

        let copy_len = nul_at.min(out.len().saturating_sub(1));
        out[..copy_len].copy_from_slice(&rest[..copy_len]);
        if copy_len < out.len() {
            out[copy_len] = 0;
        }

        self.pos += nul_at + 1;
        Ok(copy_len)
    }
}

/// Cursor over a datagram being assembled for transmission.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    #[inline]
    pub fn new(buf: &'a mut [u8]) -> Writer<'a> {
        Writer { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    fn free_capacity(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn write_i8(&mut self, v: i8) {
        assert!(self.free_capacity() >= 1, "write_i8 buffer overrun");
        self.buf[self.pos] = v as u8;
        self.pos += 1;
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.write_i8(v as i8);
    }

    #[inline]
    pub fn write_i16(&mut self, v: i16) {
        assert!(self.free_capacity() >= 2, "write_i16 buffer overrun");
        LittleEndian::write_i16(&mut self.buf[self.pos..], v);
        self.pos += 2;
    }

    #[inline]
    pub fn write_i32(&mut self, v: i32) {
        assert!(self.free_capacity() >= 4, "write_i32 buffer overrun");
        LittleEndian::write_i32(&mut self.buf[self.pos..], v);
        self.pos += 4;
    }

    /// Writes a raw byte block.
    #[inline]
    pub fn write_block(&mut self, data: &[u8]) {
        assert!(self.free_capacity() >= data.len(), "write_block buffer overrun");
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    /// Writes a NUL-terminated string.
    #[inline]
    pub fn write_cstr(&mut self, s: &str) {
        self.write_block(s.as_bytes());
        self.write_u8(0);
    }

    /// Writes a NUL-terminated name followed by a NUL-terminated decimal rendering of an
    /// integer - the (key, value) pair shape QUERY responses are built from.
    #[inline]
    pub fn write_kv_i32(&mut self, key: &str, value: i32) {
        self.write_cstr(key);
        self.write_cstr(&value.to_string());
    }

    #[inline]
    pub fn write_kv_str(&mut self, key: &str, value: &str) {
        self.write_cstr(key);
        self.write_cstr(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_integers() {
        let mut buf = [0u8; 16];
        {
            let mut w = Writer::new(&mut buf);
            w.write_i8(-5);
            w.write_i16(-1000);
            w.write_i32(123456);
        }

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_i8(), -5);
        assert_eq!(r.read_i16(), -1000);
        assert_eq!(r.read_i32(), 123456);
    }

    #[test]
    fn roundtrip_cstr() {
        let mut buf = [0u8; 64];
        let written = {
            let mut w = Writer::new(&mut buf);
            w.write_cstr("hostname");
            w.write_cstr("a relay");
            w.position()
        };

        let mut r = Reader::new(&buf[..written]);
        let mut out = [0u8; 32];
        let n = r.read_cstr(&mut out).unwrap();
        assert_eq!(&out[..n], b"hostname");
        let n = r.read_cstr(&mut out).unwrap();
        assert_eq!(&out[..n], b"a relay");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn cstr_truncates_safely_on_short_output_buffer() {
        let mut buf = [0u8; 64];
        let written = {
            let mut w = Writer::new(&mut buf);
            w.write_cstr("a-very-long-value");
            w.write_cstr("next");
            w.position()
        };

        let mut r = Reader::new(&buf[..written]);
        let mut out = [0u8; 4];
        let n = r.read_cstr(&mut out).unwrap();
        // Truncated to 3 chars + NUL within the 4-byte caller buffer.
        assert_eq!(n, 3);
        assert_eq!(&out[..3], b"a-v");
        assert_eq!(out[3], 0);

        // But the cursor skipped the *whole* original string, not just the truncated part.
        let mut out2 = [0u8; 8];
        let n2 = r.read_cstr(&mut out2).unwrap();
        assert_eq!(&out2[..n2], b"next");
    }

    #[test]
    fn cstr_without_terminator_is_truncated_error() {
        let buf = [b'a', b'b', b'c'];
        let mut r = Reader::new(&buf);
        let mut out = [0u8; 8];
        assert_eq!(r.read_cstr(&mut out), Err(Truncated));
    }

    #[test]
    fn read_block_clamps_to_remaining() {
        let buf = [1, 2, 3];
        let mut r = Reader::new(&buf);
        let block = r.read_block(10);
        assert_eq!(block, &[1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn write_kv_i32_emits_two_cstrs() {
        let mut buf = [0u8; 32];
        let written = {
            let mut w = Writer::new(&mut buf);
            w.write_kv_i32("clients", 3);
            w.position()
        };

        let mut r = Reader::new(&buf[..written]);
        let mut out = [0u8; 16];
        let n = r.read_cstr(&mut out).unwrap();
        assert_eq!(&out[..n], b"clients");
        let n = r.read_cstr(&mut out).unwrap();
        assert_eq!(&out[..n], b"3");
    }
}
