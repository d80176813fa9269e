use crate::error::Result;
use crate::Error;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Bytes prepended to every chunk payload in a data file.
pub const HEADER_SIZE: usize = 16;

/// Marker of a chunk written by `write_data`.
pub const USED_MARKER: u64 = 0xfeed_face_feed_face;

/// Marker of a chunk explicitly stamped free.
pub const FREE_MARKER: u64 = 0xdead_beef_dead_beef;

/// Fixed-size tag in front of every allocated block.
///
/// ```text
/// +-------------+-------------+
/// | marker: u64 | size: u64   |
/// +-------------+-------------+
/// ```
///
/// The marker is only a consistency check on read; the allocator never
/// consults it to decide what is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub marker: u64,
    pub size: u64,
}

impl ChunkHeader {
    pub fn used(size: u64) -> Self {
        Self {
            marker: USED_MARKER,
            size,
        }
    }

    pub fn free(size: u64) -> Self {
        Self {
            marker: FREE_MARKER,
            size,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.marker == USED_MARKER || self.marker == FREE_MARKER
    }

    pub fn is_free(&self) -> bool {
        self.marker == FREE_MARKER
    }

    /// Whether this header can front a read of `len` payload bytes at `offset`.
    pub fn covers(&self, offset: u64, len: usize) -> bool {
        self.is_valid()
            && self.size.is_power_of_two()
            && offset % self.size == 0
            && (len as u64).saturating_add(HEADER_SIZE as u64) <= self.size
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[..8], self.marker);
        LittleEndian::write_u64(&mut buf[8..], self.size);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        let mut cursor = Cursor::new(bytes);
        let marker = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("marker", e))?;
        let size = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("size", e))?;

        Ok(Self { marker, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_native_x86() {
        let encoded = ChunkHeader::used(256).encode();
        assert_eq!(&encoded[..8], &USED_MARKER.to_le_bytes());
        assert_eq!(&encoded[8..], &256u64.to_le_bytes());

        let decoded = ChunkHeader::decode(&encoded).expect("decode header");
        assert!(decoded.is_valid());
        assert!(!decoded.is_free());
        assert_eq!(decoded.size, 256);
    }

    #[test]
    fn test_encode_places_fields_in_order() {
        let encoded = ChunkHeader::free(0x0102_0304_0506_0708).encode();
        assert_eq!(
            encoded,
            [
                0xef, 0xbe, 0xad, 0xde, 0xef, 0xbe, 0xad, 0xde, // marker
                0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // size
            ]
        );
    }

    #[test]
    fn test_free_marker_is_valid() {
        let header = ChunkHeader::decode(&ChunkHeader::free(64).encode()).expect("decode");
        assert!(header.is_valid());
        assert!(header.is_free());
    }

    #[test]
    fn test_zeroed_bytes_are_invalid() {
        let header = ChunkHeader::decode(&[0u8; HEADER_SIZE]).expect("decode");
        assert!(!header.is_valid());
        assert!(!header.covers(0, 0));
    }

    #[test]
    fn test_covers_checks_size_and_alignment() {
        let header = ChunkHeader::used(128);
        assert!(header.covers(256, 112));
        assert!(!header.covers(256, 113));
        assert!(!header.covers(64, 10));
        assert!(!ChunkHeader::used(96).covers(0, 10));
    }

    #[test]
    fn test_decode_short_buffer() {
        let result = ChunkHeader::decode(&[0u8; HEADER_SIZE - 1]);
        assert!(matches!(result, Err(Error::InvalidHeader)));
    }
}
