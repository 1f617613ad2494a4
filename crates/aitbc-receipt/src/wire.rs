// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - CANONICAL WIRE CODEC
//
// Deterministic byte codec used for everything that gets hashed or signed.
// Fixed-width little-endian integers, u32-length-prefixed strings/bytes.
// One encoding per value — no maps, no floats, no optional fields.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::ReceiptError;

/// Hard cap on a single length-prefixed field (16 MiB).
/// Rejects absurd length prefixes before any allocation happens.
const MAX_FIELD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u128(&mut self, v: u128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ReceiptError> {
        if self.pos + n > self.buf.len() {
            return Err(ReceiptError::Encoding(format!(
                "truncated input: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8, ReceiptError> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u32(&mut self) -> Result<u32, ReceiptError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn take_u64(&mut self) -> Result<u64, ReceiptError> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn take_u128(&mut self) -> Result<u128, ReceiptError> {
        let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
        Ok(u128::from_le_bytes(bytes))
    }

    pub fn take_bytes(&mut self) -> Result<Vec<u8>, ReceiptError> {
        let len = self.take_u32()?;
        if len > MAX_FIELD_LEN {
            return Err(ReceiptError::Encoding(format!(
                "field length {} exceeds cap {}",
                len, MAX_FIELD_LEN
            )));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn take_str(&mut self) -> Result<String, ReceiptError> {
        let bytes = self.take_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| ReceiptError::Encoding(format!("invalid utf-8 string: {}", e)))
    }

    /// Decoding must consume the whole input — trailing bytes mean the
    /// encoding and the decoder disagree about the schema.
    pub fn finish(&self) -> Result<(), ReceiptError> {
        if self.pos != self.buf.len() {
            return Err(ReceiptError::Encoding(format!(
                "{} trailing bytes after decode",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_roundtrip() {
        let mut w = WireWriter::new();
        w.put_u8(7);
        w.put_u32(1234);
        w.put_u64(u64::MAX);
        w.put_u128(u128::MAX - 5);
        w.put_str("hello aitbc");
        w.put_bytes(&[0, 1, 2, 3]);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.take_u8().unwrap(), 7);
        assert_eq!(r.take_u32().unwrap(), 1234);
        assert_eq!(r.take_u64().unwrap(), u64::MAX);
        assert_eq!(r.take_u128().unwrap(), u128::MAX - 5);
        assert_eq!(r.take_str().unwrap(), "hello aitbc");
        assert_eq!(r.take_bytes().unwrap(), vec![0, 1, 2, 3]);
        r.finish().unwrap();
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut w = WireWriter::new();
        w.put_u32(1);
        w.put_u8(0xFF);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        r.take_u32().unwrap();
        assert!(r.finish().is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let mut w = WireWriter::new();
        w.put_u64(42);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes[..4]);
        assert!(r.take_u64().is_err());
    }

    #[test]
    fn test_absurd_length_prefix_rejected() {
        // Length prefix claims 4 GiB — must fail before allocating
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut r = WireReader::new(&bytes);
        assert!(r.take_bytes().is_err());
    }
}
