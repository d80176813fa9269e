//! Free-list persistence format.
//!
//! The free-list file is a full snapshot of the in-memory buckets:
//!
//! ```text
//! +-------------------+----------+-----+----------+
//! | bucket_count: u64 | bucket 1 | ... | bucket n |
//! +-------------------+----------+-----+----------+
//! ```
//!
//! and every bucket is a self-checking record:
//!
//! ```text
//! +------------------+----------+------------+-------------------+-----------+
//! | record_size: u64 | key: u64 | count: u64 | offset: u64 * n   | crc32:u32 |
//! +------------------+----------+------------+-------------------+-----------+
//!                    |<------------ covered by crc32 ----------->|
//! ```
//!
//! `record_size` counts every byte after itself. All integers are
//! little-endian. A snapshot with `bucket_count == 0` is the invalidated
//! state written before the first mutation after a flush.

use crate::error::Result;
use crate::Error;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_JAMCRC};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// key + count + crc
const RECORD_OVERHEAD: u64 = 8 + 8 + 4;

/// Bucket key (block size) to the set of free offsets of that size.
pub type Buckets = BTreeMap<u64, BTreeSet<u64>>;

/// Encoded form of a snapshot holding no buckets.
pub const INVALIDATED_SNAPSHOT: [u8; 8] = [0u8; 8];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreelistBucket {
    pub key: u64,
    pub offsets: Vec<u64>,
}

impl FreelistBucket {
    pub fn new(key: u64, offsets: &BTreeSet<u64>) -> Self {
        Self {
            key,
            offsets: offsets.iter().copied().collect(),
        }
    }

    /// Value of the leading `record_size` field
    pub fn record_size(&self) -> u64 {
        RECORD_OVERHEAD + 8 * self.offsets.len() as u64
    }

    /// Total bytes the bucket occupies in the file
    pub fn encoded_len(&self) -> usize {
        8 + self.record_size() as usize
    }

    fn body(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(16 + 8 * self.offsets.len());
        body.write_u64::<LittleEndian>(self.key)
            .map_err(|e| Error::Encode("key", e))?;
        body.write_u64::<LittleEndian>(self.offsets.len() as u64)
            .map_err(|e| Error::Encode("count", e))?;
        for offset in &self.offsets {
            body.write_u64::<LittleEndian>(*offset)
                .map_err(|e| Error::Encode("offset", e))?;
        }
        Ok(body)
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        let body = self.body()?;
        let crc = CRC32.checksum(&body);

        writer
            .write_u64::<LittleEndian>(self.record_size())
            .map_err(|e| Error::Encode("record_size", e))?;
        writer
            .write_all(&body)
            .map_err(|e| Error::Encode("bucket", e))?;
        writer
            .write_u32::<LittleEndian>(crc)
            .map_err(|e| Error::Encode("crc", e))?;
        Ok(())
    }

    /// Decodes one bucket, verifying its checksum and internal lengths.
    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let record_size = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("record_size", e))?;

        let remaining = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
        if record_size < RECORD_OVERHEAD
            || (record_size - RECORD_OVERHEAD) % 8 != 0
            || record_size > remaining
        {
            return Err(Error::CorruptFreelist(format!(
                "bucket record size {} is impossible with {} bytes left",
                record_size, remaining
            )));
        }

        let mut body = vec![0u8; (record_size - 4) as usize];
        cursor
            .read_exact(&mut body)
            .map_err(|e| Error::Decode("bucket", e))?;
        let stored_crc = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Decode("crc", e))?;

        let computed_crc = CRC32.checksum(&body);
        if computed_crc != stored_crc {
            return Err(Error::CorruptFreelist(format!(
                "bucket checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, computed_crc
            )));
        }

        let mut fields = Cursor::new(&body[..]);
        let key = fields
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("key", e))?;
        let count = fields
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("count", e))?;
        if count.checked_mul(8) != Some(body.len() as u64 - 16) {
            return Err(Error::CorruptFreelist(format!(
                "bucket {} claims {} offsets in a {} byte record",
                key, count, record_size
            )));
        }

        let mut offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            offsets.push(
                fields
                    .read_u64::<LittleEndian>()
                    .map_err(|e| Error::Decode("offset", e))?,
            );
        }

        Ok(Self { key, offsets })
    }
}

/// Serializes every non-empty bucket in ascending key order.
pub fn encode_snapshot(buckets: &Buckets) -> Result<Vec<u8>> {
    let records: Vec<FreelistBucket> = buckets
        .iter()
        .filter(|(_, offsets)| !offsets.is_empty())
        .map(|(key, offsets)| FreelistBucket::new(*key, offsets))
        .collect();

    let len = 8 + records.iter().map(|r| r.encoded_len()).sum::<usize>();
    let mut buf = Vec::with_capacity(len);
    buf.write_u64::<LittleEndian>(records.len() as u64)
        .map_err(|e| Error::Encode("bucket_count", e))?;
    for record in &records {
        record.encode(&mut buf)?;
    }
    Ok(buf)
}

/// Parses a whole free-list file. Any damage fails the entire snapshot.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Buckets> {
    if bytes.len() < 8 {
        return Err(Error::CorruptFreelist(format!(
            "snapshot of {} bytes has no bucket count",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let count = cursor
        .read_u64::<LittleEndian>()
        .map_err(|e| Error::Decode("bucket_count", e))?;

    let mut buckets = Buckets::new();
    for _ in 0..count {
        let bucket = FreelistBucket::decode(&mut cursor)?;
        if bucket.offsets.is_empty() {
            return Err(Error::CorruptFreelist(format!(
                "bucket {} is empty",
                bucket.key
            )));
        }
        let key = bucket.key;
        if buckets
            .insert(key, bucket.offsets.into_iter().collect())
            .is_some()
        {
            return Err(Error::CorruptFreelist(format!("bucket {} appears twice", key)));
        }
    }

    if cursor.position() != bytes.len() as u64 {
        return Err(Error::CorruptFreelist(format!(
            "{} trailing bytes after {} buckets",
            bytes.len() as u64 - cursor.position(),
            count
        )));
    }

    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Buckets {
        let mut buckets = Buckets::new();
        buckets.insert(64, [64u64, 192].into_iter().collect());
        buckets.insert(1024, [1024u64].into_iter().collect());
        buckets
    }

    #[test]
    fn test_bucket_layout() -> Result<()> {
        let bucket = FreelistBucket::new(128, &[128u64, 384].into_iter().collect());
        let mut buf = Vec::new();
        bucket.encode(&mut buf)?;

        assert_eq!(buf.len(), bucket.encoded_len());
        assert_eq!(bucket.record_size(), 8 + 8 + 16 + 4);
        assert_eq!(&buf[0..8], &bucket.record_size().to_le_bytes());
        assert_eq!(&buf[8..16], &128u64.to_le_bytes());
        assert_eq!(&buf[16..24], &2u64.to_le_bytes());
        assert_eq!(&buf[24..32], &128u64.to_le_bytes());
        assert_eq!(&buf[32..40], &384u64.to_le_bytes());

        let crc = u32::from_le_bytes(buf[40..44].try_into().unwrap());
        assert_eq!(crc, CRC32.checksum(&buf[8..40]));
        Ok(())
    }

    #[test]
    fn test_crc_matches_reflected_table_without_final_xor() {
        // Standard CRC-32 of "123456789" is 0xCBF43926; without the final
        // inversion the register holds its complement.
        assert_eq!(CRC32.checksum(b"123456789"), !0xCBF4_3926u32);
    }

    #[test]
    fn test_snapshot_roundtrip() -> Result<()> {
        let buckets = sample();
        let bytes = encode_snapshot(&buckets)?;
        assert_eq!(decode_snapshot(&bytes)?, buckets);
        Ok(())
    }

    #[test]
    fn test_empty_buckets_are_skipped() -> Result<()> {
        let mut buckets = sample();
        buckets.insert(256, BTreeSet::new());

        let bytes = encode_snapshot(&buckets)?;
        assert_eq!(&bytes[0..8], &2u64.to_le_bytes());
        assert_eq!(decode_snapshot(&bytes)?, sample());
        Ok(())
    }

    #[test]
    fn test_invalidated_snapshot_is_empty() -> Result<()> {
        assert_eq!(encode_snapshot(&Buckets::new())?, INVALIDATED_SNAPSHOT.to_vec());
        assert!(decode_snapshot(&INVALIDATED_SNAPSHOT)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_flipped_offset_fails_checksum() -> Result<()> {
        let mut bytes = encode_snapshot(&sample())?;
        // First offset of the first bucket
        bytes[8 + 8 + 8 + 8] ^= 0x40;

        let err = decode_snapshot(&bytes).unwrap_err();
        assert!(matches!(err, Error::CorruptFreelist(_)), "{}", err);
        Ok(())
    }

    #[test]
    fn test_truncated_snapshot_fails() -> Result<()> {
        let bytes = encode_snapshot(&sample())?;
        for cut in [0, 4, 8, 20, bytes.len() - 1] {
            assert!(decode_snapshot(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
        Ok(())
    }

    #[test]
    fn test_count_disagreeing_with_record_size_fails() -> Result<()> {
        let bucket = FreelistBucket::new(64, &[0u64, 64].into_iter().collect());
        let mut record = Vec::new();
        bucket.encode(&mut record)?;

        // Claim three offsets and re-seal the checksum so only the count lies
        record[16..24].copy_from_slice(&3u64.to_le_bytes());
        let crc = CRC32.checksum(&record[8..record.len() - 4]);
        let crc_at = record.len() - 4;
        record[crc_at..].copy_from_slice(&crc.to_le_bytes());

        let mut bytes = 1u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&record);
        assert!(matches!(
            decode_snapshot(&bytes),
            Err(Error::CorruptFreelist(_))
        ));
        Ok(())
    }

    #[test]
    fn test_trailing_garbage_fails() -> Result<()> {
        let mut bytes = encode_snapshot(&sample())?;
        bytes.extend_from_slice(&[0xAB; 3]);
        assert!(decode_snapshot(&bytes).is_err());
        Ok(())
    }
}
