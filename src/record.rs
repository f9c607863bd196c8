//! The on-disk record codec.
//!
//! A record is laid out as a fixed-width header followed by the raw key and
//! value bytes, with no padding:
//!
//! ```text
//! checksum:   u32 (4 bytes, little-endian)
//! timestamp:  u64 (8 bytes, little-endian)
//! key_size:   u32 (4 bytes, little-endian)
//! value_size: u32 (4 bytes, little-endian) -- TOMBSTONE sentinel for deletes
//! key:        [u8; key_size]
//! value:      [u8; value_size]             -- absent for tombstones
//! ```
//!
//! `checksum` is a CRC-32 (IEEE) over every byte that follows it.

use std::io::{self, Read};

/// Marks `value_size` as a tombstone rather than a length. A live value can
/// never be this long (it would not fit a `u32` alongside a key), so the two
/// cases cannot collide; a live value of length zero is represented by
/// `value_size == 0`, distinct from this sentinel.
pub const TOMBSTONE: u32 = u32::MAX;

/// Size in bytes of the fixed header shared by data-file and hint-file records.
pub const HEADER_SIZE: usize = 4 + 8 + 4 + 4;

/// A decoded on-disk record. `value` is `None` for a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn put(timestamp: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            timestamp,
            key,
            value: Some(value),
        }
    }

    pub fn tombstone(timestamp: u64, key: Vec<u8>) -> Self {
        Self {
            timestamp,
            key,
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Encodes the record into a freshly allocated buffer, ready to be
    /// appended to a datafile.
    pub fn encode(&self) -> Vec<u8> {
        let value_len = self.value.as_ref().map_or(0, Vec::len);
        let value_size_field = self.value.as_ref().map_or(TOMBSTONE, |v| v.len() as u32);
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.key.len() + value_len);

        // Reserve space for the checksum; it is computed last, over
        // everything written after it.
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&value_size_field.to_le_bytes());
        buf.extend_from_slice(&self.key);
        if let Some(value) = &self.value {
            buf.extend_from_slice(value);
        }

        let checksum = crc32fast::hash(&buf[4..]);
        buf[0..4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }
}

/// What decoding one record from a byte stream produced.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A valid record, and the total number of bytes it occupied on disk.
    Record(Record, usize),
    /// A clean end-of-file was reached before a complete record could be
    /// read. This is expected at the tail of a log left by a crashed
    /// writer and is not itself an error.
    Truncated,
    /// The bytes read do not form a valid record: the checksum did not
    /// match, or the declared sizes are impossible (exceed the configured
    /// bounds, or run past the rest of the stream).
    Corrupt(String),
}

/// Decodes one record from `r`, enforcing `max_key_size`/`max_value_size` on
/// the declared lengths. Returns `Ok` for every outcome in [`DecodeOutcome`];
/// only a genuine I/O error (other than a clean EOF) is returned as `Err`.
pub fn decode<R: Read>(
    r: &mut R,
    max_key_size: u32,
    max_value_size: u32,
) -> io::Result<DecodeOutcome> {
    let mut header = [0u8; HEADER_SIZE];
    let n = read_fill(r, &mut header)?;
    if n < HEADER_SIZE {
        return Ok(DecodeOutcome::Truncated);
    }

    let checksum = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let timestamp = u64::from_le_bytes(header[4..12].try_into().unwrap());
    let key_size = u32::from_le_bytes(header[12..16].try_into().unwrap());
    let value_size_field = u32::from_le_bytes(header[16..20].try_into().unwrap());
    let is_tombstone = value_size_field == TOMBSTONE;
    let value_size = if is_tombstone { 0 } else { value_size_field };

    if key_size > max_key_size {
        return Ok(DecodeOutcome::Corrupt(format!(
            "key_size {key_size} exceeds configured max of {max_key_size}"
        )));
    }
    if value_size > max_value_size {
        return Ok(DecodeOutcome::Corrupt(format!(
            "value_size {value_size} exceeds configured max of {max_value_size}"
        )));
    }

    let mut key = vec![0u8; key_size as usize];
    if read_fill(r, &mut key)? < key.len() {
        return Ok(DecodeOutcome::Truncated);
    }
    let mut value = vec![0u8; value_size as usize];
    if read_fill(r, &mut value)? < value.len() {
        return Ok(DecodeOutcome::Truncated);
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[4..HEADER_SIZE]);
    hasher.update(&key);
    hasher.update(&value);
    let computed = hasher.finalize();
    if computed != checksum {
        return Ok(DecodeOutcome::Corrupt(format!(
            "checksum mismatch: stored {checksum:#010x}, computed {computed:#010x}"
        )));
    }

    let total = HEADER_SIZE + key.len() + value.len();
    let record = if is_tombstone {
        Record::tombstone(timestamp, key)
    } else {
        Record::put(timestamp, key, value)
    };
    Ok(DecodeOutcome::Record(record, total))
}

/// Fills `buf` from `r`, retrying on short reads, and returns the number of
/// bytes actually filled before a clean EOF (which may be fewer than
/// `buf.len()`).
fn read_fill<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
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

    #[test]
    fn round_trips_a_put_record() {
        let record = Record::put(42, b"key".to_vec(), b"value".to_vec());
        let buf = record.encode();
        match decode(&mut &buf[..], 1024, 1024).unwrap() {
            DecodeOutcome::Record(decoded, len) => {
                assert_eq!(decoded, record);
                assert_eq!(len, buf.len());
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_a_tombstone() {
        let record = Record::tombstone(7, b"gone".to_vec());
        let buf = record.encode();
        match decode(&mut &buf[..], 1024, 1024).unwrap() {
            DecodeOutcome::Record(decoded, _) => {
                assert!(decoded.is_tombstone());
                assert_eq!(decoded.key, b"gone");
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_empty_key_and_value() {
        let record = Record::put(1, Vec::new(), Vec::new());
        let buf = record.encode();
        match decode(&mut &buf[..], 1024, 1024).unwrap() {
            DecodeOutcome::Record(decoded, _) => {
                assert_eq!(decoded.key, Vec::<u8>::new());
                assert_eq!(decoded.value, Some(Vec::new()));
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn detects_checksum_corruption() {
        let record = Record::put(1, b"key".to_vec(), b"value".to_vec());
        let mut buf = record.encode();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        match decode(&mut &buf[..], 1024, 1024).unwrap() {
            DecodeOutcome::Corrupt(_) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn detects_oversized_declared_lengths() {
        let record = Record::put(1, b"key".to_vec(), b"value".to_vec());
        let buf = record.encode();
        match decode(&mut &buf[..], 2, 1024).unwrap() {
            DecodeOutcome::Corrupt(_) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn reports_truncation_at_a_clean_boundary() {
        let record = Record::put(1, b"key".to_vec(), b"value".to_vec());
        let buf = record.encode();
        for cut in 0..buf.len() {
            match decode(&mut &buf[..cut], 1024, 1024).unwrap() {
                DecodeOutcome::Truncated => {}
                other => panic!("expected truncation at cut {cut}, got {other:?}"),
            }
        }
    }
}
