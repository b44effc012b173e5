//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Every message in this crate is built with the `put_*` helpers and parsed
//! with [`Reader`]. Reads never panic: running off the end of the input is a
//! [`KestrelError::Protocol`].
//!
//! ```text
//! byte        1 octet
//! boolean     1 octet, 0 = FALSE
//! uint32      4 octets, big endian
//! uint64      8 octets, big endian
//! string      uint32 length + bytes
//! mpint       two's complement string, minimal length
//! name-list   comma separated ASCII names as a string
//! ```

use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};

/// Writes a length-prefixed string.
pub fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Writes a boolean.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a comma separated name-list.
pub fn put_name_list<S: AsRef<str>>(buf: &mut BytesMut, names: &[S]) {
    let joined = names
        .iter()
        .map(|n| n.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    put_string(buf, joined.as_bytes());
}

/// Writes an unsigned big-endian magnitude as an mpint.
pub fn put_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    put_string(buf, &encode_mpint(magnitude));
}

/// Encodes an unsigned big-endian magnitude as mpint content (no length).
///
/// Leading zeros are stripped and a zero byte is prepended when the high bit
/// is set so the value stays positive.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Cursor over an SSH-encoded message.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// `true` once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current offset from the start of the input.
    pub fn position(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize, what: &str) -> KestrelResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(KestrelError::Protocol(format!(
                "message truncated reading {} ({} bytes needed, {} left)",
                what,
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> KestrelResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a boolean (any non-zero byte is TRUE).
    pub fn read_bool(&mut self) -> KestrelResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> KestrelResult<u32> {
        let b = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian uint64.
    pub fn read_u64(&mut self) -> KestrelResult<u64> {
        let b = self.take(8, "uint64")?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads a length-prefixed string as raw bytes.
    pub fn read_string(&mut self) -> KestrelResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a length-prefixed string that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> KestrelResult<String> {
        let bytes = self.read_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| KestrelError::Protocol("string contains invalid UTF-8".to_string()))
    }

    /// Reads a comma separated name-list.
    pub fn read_name_list(&mut self) -> KestrelResult<Vec<String>> {
        let s = self.read_utf8()?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        Ok(s.split(',').map(String::from).collect())
    }

    /// Reads an mpint and returns its unsigned magnitude.
    ///
    /// Negative values are rejected; SSH never sends them for key exchange.
    pub fn read_mpint(&mut self) -> KestrelResult<&'a [u8]> {
        let bytes = self.read_string()?;
        if bytes.first().map_or(false, |b| b & 0x80 != 0) {
            return Err(KestrelError::Protocol("negative mpint".to_string()));
        }
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        Ok(&bytes[start..])
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> KestrelResult<&'a [u8]> {
        self.take(len, "bytes")
    }

    /// Consumes the rest of the input.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(&self) -> KestrelResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(KestrelError::Protocol(format!(
                "{} trailing bytes after message",
                self.remaining()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_and_integers() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_u32(0xdead_beef);
        buf.put_u64(1 << 40);
        put_string(&mut buf, b"ssh-userauth");
        put_bool(&mut buf, true);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_utf8().unwrap(), "ssh-userauth");
        assert!(r.read_bool().unwrap());
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_name_list() {
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &["curve25519-sha256", "diffie-hellman-group14-sha256"]);
        put_name_list::<&str>(&mut buf, &[]);

        let mut r = Reader::new(&buf);
        assert_eq!(
            r.read_name_list().unwrap(),
            vec!["curve25519-sha256", "diffie-hellman-group14-sha256"]
        );
        assert!(r.read_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_mpint_encoding() {
        // RFC 4251 Section 5 examples
        assert_eq!(encode_mpint(&[0x00]), Vec::<u8>::new());
        assert_eq!(
            encode_mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]),
            vec![0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
        assert_eq!(encode_mpint(&[0x80]), vec![0x00, 0x80]);
        assert_eq!(encode_mpint(&[0x00, 0x00, 0x7f]), vec![0x7f]);

        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00, 0x80, 0x01]);
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_mpint().unwrap(), &[0x80, 0x01]);
    }

    #[test]
    fn test_truncated_input_is_protocol_error() {
        let mut r = Reader::new(&[0, 0, 0, 10, b'a']);
        assert!(matches!(r.read_string(), Err(KestrelError::Protocol(_))));

        let mut r = Reader::new(&[1, 2]);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let r = Reader::new(&[1]);
        assert!(r.finish().is_err());
    }
}
