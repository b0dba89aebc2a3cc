//! On-disk record framing.
//!
//! ```text
//! ┌─────────────────┬──────────────────────┬─────────────────┐
//! │  Length (4B)    │   Payload (variable) │   CRC32 (4B)    │
//! │  little-endian  │   raw bytes          │   little-endian │
//! └─────────────────┴──────────────────────┴─────────────────┘
//! ```
//!
//! The CRC covers the length field and the payload, so a torn length is
//! caught as well as a torn payload.

use crc32fast::Hasher;
use std::io::{self, Read, Write};

pub(crate) const LENGTH_SIZE: u64 = 4;
pub(crate) const CRC_SIZE: u64 = 4;

/// Bytes a payload of `len` occupies on disk.
#[inline]
pub(crate) fn framed_len(len: usize) -> u64 {
    LENGTH_SIZE + len as u64 + CRC_SIZE
}

#[inline]
fn checksum(length: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

pub(crate) fn write_record<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    let length = data.len() as u32;
    let mut buf = Vec::with_capacity(framed_len(data.len()) as usize);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(&checksum(length, data).to_le_bytes());
    w.write_all(&buf)
}

/// What was found at a read position.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// A complete record with a valid checksum
    Record(Vec<u8>),
    /// End of data exactly on a record boundary
    End,
    /// The data stops partway through a record
    Torn,
    /// A complete record whose length or checksum is wrong
    Corrupt,
}

pub(crate) fn read_record<R: Read>(r: &mut R, max_len: usize) -> io::Result<ReadOutcome> {
    let mut len_buf = [0u8; LENGTH_SIZE as usize];
    match read_full(r, &mut len_buf)? {
        0 => return Ok(ReadOutcome::End),
        n if n < len_buf.len() => return Ok(ReadOutcome::Torn),
        _ => {}
    }

    let length = u32::from_le_bytes(len_buf);
    if length as usize > max_len {
        return Ok(ReadOutcome::Corrupt);
    }

    let mut data = vec![0u8; length as usize];
    if read_full(r, &mut data)? < data.len() {
        return Ok(ReadOutcome::Torn);
    }

    let mut crc_buf = [0u8; CRC_SIZE as usize];
    if read_full(r, &mut crc_buf)? < crc_buf.len() {
        return Ok(ReadOutcome::Torn);
    }

    if checksum(length, &data) != u32::from_le_bytes(crc_buf) {
        return Ok(ReadOutcome::Corrupt);
    }
    Ok(ReadOutcome::Record(data))
}

/// Like `read_exact`, but reports how much was read instead of failing on EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn framed(data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_record(&mut buf, data).unwrap();
        buf
    }

    #[test]
    fn test_record_layout() {
        let buf = framed(b"hello");
        assert_eq!(buf.len() as u64, framed_len(5));
        assert_eq!(&buf[..4], &5u32.to_le_bytes());
        assert_eq!(&buf[4..9], b"hello");
    }

    #[test]
    fn test_reads_back_consecutive_records() {
        let mut buf = framed(b"one");
        buf.extend(framed(b""));
        buf.extend(framed(b"three"));
        let mut cursor = Cursor::new(buf);

        assert_eq!(read_record(&mut cursor, 64).unwrap(), ReadOutcome::Record(b"one".to_vec()));
        assert_eq!(read_record(&mut cursor, 64).unwrap(), ReadOutcome::Record(Vec::new()));
        assert_eq!(read_record(&mut cursor, 64).unwrap(), ReadOutcome::Record(b"three".to_vec()));
        assert_eq!(read_record(&mut cursor, 64).unwrap(), ReadOutcome::End);
    }

    #[test]
    fn test_truncation_is_torn_at_every_cut() {
        let buf = framed(b"payload");
        for cut in 1..buf.len() {
            let mut cursor = Cursor::new(&buf[..cut]);
            assert_eq!(read_record(&mut cursor, 64).unwrap(), ReadOutcome::Torn, "cut at {}", cut);
        }
    }

    #[test]
    fn test_flipped_bit_is_corrupt() {
        let mut buf = framed(b"payload");
        buf[6] ^= 0x01;
        assert_eq!(read_record(&mut Cursor::new(buf), 64).unwrap(), ReadOutcome::Corrupt);
    }

    #[test]
    fn test_oversized_length_is_corrupt() {
        let buf = framed(b"payload");
        assert_eq!(read_record(&mut Cursor::new(buf), 3).unwrap(), ReadOutcome::Corrupt);
    }
}
