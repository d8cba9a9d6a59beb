//! Small helpers shared across the crate.

use std::io::{Read, Result};

use byteorder::{LittleEndian, ReadBytesExt};

/// Read a little-endian `i32` from the reader.
pub fn read_i32(reader: &mut impl Read) -> Result<i32> {
    reader.read_i32::<LittleEndian>()
}

/// Read a little-endian `u32` from the reader.
pub fn read_u32(reader: &mut impl Read) -> Result<u32> {
    reader.read_u32::<LittleEndian>()
}

/// Read a little-endian `f32` from the reader.
pub fn read_f32(reader: &mut impl Read) -> Result<f32> {
    reader.read_f32::<LittleEndian>()
}

/// Read `len` bytes from the reader.
pub fn read_bytes_with_len(reader: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Used to buffer incoming token surfaces until a valid UTF-8 string can be
/// formed from them. Byte-fallback tokens can split multi-byte characters
/// across several steps; callers only ever see whole characters.
#[derive(Debug, Default)]
pub struct TokenUtf8Buffer {
    buffer: Vec<u8>,
}

impl TokenUtf8Buffer {
    /// Create a new buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token's surface bytes to the buffer. If the bytes in the buffer
    /// now form a valid UTF-8 string, it is returned and the buffer cleared.
    pub fn push(&mut self, token: &[u8]) -> Option<String> {
        if self.buffer.is_empty() {
            match std::str::from_utf8(token) {
                Ok(s) => return Some(s.to_owned()),
                Err(_) => {
                    self.buffer.extend_from_slice(token);
                    return None;
                }
            }
        }

        self.buffer.extend_from_slice(token);
        match std::str::from_utf8(&self.buffer) {
            Ok(s) => {
                let out = s.to_owned();
                self.buffer.clear();
                Some(out)
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian() {
        let mut cursor = std::io::Cursor::new(vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(read_i32(&mut cursor).unwrap(), 1);
        assert_eq!(read_f32(&mut cursor).unwrap(), 1.0);
    }

    #[test]
    fn valid_utf8_passes_through() {
        let mut buffer = TokenUtf8Buffer::new();
        assert_eq!(buffer.push(b"hello").as_deref(), Some("hello"));
    }

    #[test]
    fn partial_utf8_is_buffered() {
        // "é" is 0xc3 0xa9; feed it one byte at a time.
        let mut buffer = TokenUtf8Buffer::new();
        assert_eq!(buffer.push(&[0xc3]), None);
        assert_eq!(buffer.push(&[0xa9]).as_deref(), Some("é"));
        // The buffer resets afterwards.
        assert_eq!(buffer.push(b"x").as_deref(), Some("x"));
    }
}
