//! In-memory buddy free-list.
//!
//! A data file of nominal size `L` (a power of two) is an implicit binary
//! tree of aligned power-of-two blocks. A block of size `S` at offset `O`
//! has exactly one buddy, `O ^ S`, and a parent of size `2S` at
//! `O & !(2S - 1)`.
//!
//! Invariants kept by every operation:
//! - every key is a power of two, at least `min_size` and below `L`, so the
//!   whole file is never a single block;
//! - every offset is aligned to its key and the block lies inside `L`;
//! - no free block has a free ancestor.
//!
//! Growth doubles `L` and publishes the new upper half `[L, 2L)` as a single
//! free block, which is why blocks always exist at `0` and `L / 2`.

use super::bucket::Buckets;
use crate::error::Result;
use crate::Error;

use std::collections::BTreeSet;

/// Rounds up to the next power of two. Zero stays zero.
pub fn round_up_pow2(size: u64) -> u64 {
    if size == 0 {
        0
    } else {
        size.next_power_of_two()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Freelist {
    buckets: Buckets,
    min_size: u64,
    allocated_size: u64,
    largest: u64,
}

impl Freelist {
    /// An empty free-list over a file of nominal size `allocated_size`.
    pub fn new(min_size: u64, allocated_size: u64) -> Self {
        debug_assert!(min_size.is_power_of_two());
        Self {
            buckets: Buckets::new(),
            min_size,
            allocated_size: allocated_size.max(min_size),
            largest: 0,
        }
    }

    /// Rebuilds a free-list from persisted buckets.
    ///
    /// The nominal size is raised to cover every loaded block: growth never
    /// extends the data file, so free blocks may lie past its end.
    pub fn from_buckets(min_size: u64, allocated_size: u64, buckets: Buckets) -> Result<Self> {
        let mut end = 0u64;
        for (size, offsets) in &buckets {
            if let Some(last) = offsets.iter().next_back() {
                let block_end = last.checked_add(*size).ok_or_else(|| {
                    Error::FreelistInconsistent(format!(
                        "block {} of size {} overflows the file offset space",
                        last, size
                    ))
                })?;
                end = end.max(block_end);
            }
        }

        let covering = end.checked_next_power_of_two().ok_or_else(|| {
            Error::FreelistInconsistent(format!(
                "free blocks end at {} which no store size can cover",
                end
            ))
        })?;
        let mut freelist = Self::new(min_size, allocated_size.max(covering));
        freelist.buckets = buckets;
        freelist.buckets.retain(|_, offsets| !offsets.is_empty());
        freelist.calc_largest_free_chunk();
        freelist.verify()?;
        Ok(freelist)
    }

    /// Conservative free-list for a file whose free-list was lost.
    ///
    /// Only the gap between the end of the file and the nominal size is
    /// treated as free; every byte that was ever written stays allocated.
    /// The gap is covered top-down by the largest aligned blocks that fit.
    pub fn reconstruct(min_size: u64, allocated_size: u64, file_len: u64) -> Self {
        let mut freelist = Self::new(min_size, allocated_size);
        let nominal = freelist.allocated_size;

        let mut top = nominal;
        while top > file_len {
            let gap = top - file_len;
            // Largest power of two that fits in the gap and keeps the block aligned
            let mut block = 1u64 << (63 - gap.leading_zeros());
            block = block.min(1u64 << top.trailing_zeros());
            if block >= nominal {
                block = nominal / 2;
            }
            if block < min_size {
                break;
            }
            top -= block;
            freelist.buckets.entry(block).or_default().insert(top);
        }

        freelist.calc_largest_free_chunk();
        freelist
    }

    pub fn min_size(&self) -> u64 {
        self.min_size
    }

    /// Nominal file size, including free blocks past the end of the file
    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub fn largest_free_chunk(&self) -> u64 {
        self.largest
    }

    pub fn buckets(&self) -> &Buckets {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Sum of the sizes of all free blocks
    pub fn free_bytes(&self) -> u64 {
        self.buckets
            .iter()
            .map(|(size, offsets)| size * offsets.len() as u64)
            .sum()
    }

    pub fn contains(&self, offset: u64, size: u64) -> bool {
        self.buckets
            .get(&size)
            .is_some_and(|offsets| offsets.contains(&offset))
    }

    /// Whether the block, or a block containing it, is on the free-list.
    pub fn is_free(&self, offset: u64, size: u64) -> bool {
        self.contains(offset, size) || self.is_parent_block_free(offset, size)
    }

    /// Block size needed to hold `payload` bytes behind a `header`-byte tag.
    pub fn required_size(&self, payload: u64, header: u64) -> Result<u64> {
        payload
            .checked_add(header)
            .map(|size| size.max(self.min_size))
            .and_then(|size| size.checked_next_power_of_two())
            .ok_or_else(|| {
                Error::InvalidOperation(format!("allocation of {} bytes is too large", payload))
            })
    }

    /// Hands out a free block of exactly `size` bytes, growing if needed.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        if !size.is_power_of_two() || size < self.min_size {
            return Err(Error::InvalidOperation(format!(
                "block size {} is not a power of two of at least {}",
                size, self.min_size
            )));
        }

        if size > self.largest {
            self.grow(size)?;
        }

        let offset = self.search(size)?;
        self.calc_largest_free_chunk();
        Ok(offset)
    }

    /// Doubles the nominal size until a block of `size` bytes is free.
    fn grow(&mut self, size: u64) -> Result<()> {
        while size > self.largest {
            let doubled = self.allocated_size.checked_mul(2).ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "cannot grow past {} bytes for a {} byte block",
                    self.allocated_size, size
                ))
            })?;

            let upper_half = self.allocated_size;
            self.buckets.entry(upper_half).or_default().insert(upper_half);
            self.largest = upper_half;
            self.allocated_size = doubled;

            tracing::trace!(allocated_size = doubled, "Grew data store");
        }
        Ok(())
    }

    /// Takes the lowest free block of the smallest size `>= size` and splits
    /// it down, returning the first half at every level and publishing the
    /// second half as free.
    fn search(&mut self, size: u64) -> Result<u64> {
        let (&found, offsets) = self.buckets.range_mut(size..).next().ok_or_else(|| {
            Error::InvalidState(format!("no free block of at least {} bytes", size))
        })?;

        let offset = offsets.pop_first().ok_or_else(|| {
            Error::FreelistInconsistent(format!("bucket {} is empty", found))
        })?;
        if offsets.is_empty() {
            self.buckets.remove(&found);
        }

        let mut block = found;
        while block > size {
            block /= 2;
            self.buckets.entry(block).or_default().insert(offset + block);
        }

        Ok(offset)
    }

    /// Rejects blocks that cannot exist in this file.
    pub fn check_block(&self, offset: u64, size: u64) -> Result<()> {
        if !size.is_power_of_two() || size < self.min_size {
            return Err(Error::InvalidOperation(format!(
                "block size {} is not a power of two of at least {}",
                size, self.min_size
            )));
        }
        if offset % size != 0 {
            return Err(Error::InvalidOperation(format!(
                "offset {} is not aligned to block size {}",
                offset, size
            )));
        }
        if offset.checked_add(size).map_or(true, |end| end > self.allocated_size) {
            return Err(Error::InvalidOperation(format!(
                "block {}+{} lies outside the {} byte store",
                offset, size, self.allocated_size
            )));
        }
        Ok(())
    }

    /// Returns a block to the free-list, merging it with its buddy as far up
    /// the tree as possible.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        self.check_block(offset, size)?;

        let (mut offset, mut size) = (offset, size);
        loop {
            // Already covered by a free ancestor: nothing to record
            if self.is_parent_block_free(offset, size) {
                tracing::trace!(offset, size, "Block already free through an ancestor");
                break;
            }

            self.absorb_descendants(offset, size);

            let parent = size * 2;
            let buddy = offset ^ size;
            if parent < self.allocated_size && self.take(size, buddy) {
                offset = offset.min(buddy);
                size = parent;
                continue;
            }

            self.buckets.entry(size).or_default().insert(offset);
            break;
        }

        self.calc_largest_free_chunk();
        Ok(())
    }

    /// Whether a strictly larger free block contains `offset`.
    pub fn is_parent_block_free(&self, offset: u64, size: u64) -> bool {
        self.buckets
            .range(size.saturating_add(1)..)
            .any(|(ancestor, offsets)| offsets.contains(&(offset & !(ancestor - 1))))
    }

    /// Drops free blocks nested inside `[offset, offset + size)`.
    fn absorb_descendants(&mut self, offset: u64, size: u64) {
        let end = offset + size;
        let mut absorbed = 0usize;
        for (_, offsets) in self.buckets.range_mut(..size) {
            let nested: Vec<u64> = offsets.range(offset..end).copied().collect();
            for child in &nested {
                offsets.remove(child);
            }
            absorbed += nested.len();
        }

        if absorbed > 0 {
            self.buckets.retain(|_, offsets| !offsets.is_empty());
            tracing::warn!(offset, size, absorbed, "Freed block covered free descendants");
        }
    }

    fn take(&mut self, size: u64, offset: u64) -> bool {
        let Some(offsets) = self.buckets.get_mut(&size) else {
            return false;
        };
        if !offsets.remove(&offset) {
            return false;
        }
        if offsets.is_empty() {
            self.buckets.remove(&size);
        }
        true
    }

    fn calc_largest_free_chunk(&mut self) {
        self.largest = self.buckets.keys().next_back().copied().unwrap_or(0);
    }

    /// Full structural check of the free-list.
    pub fn verify(&self) -> Result<()> {
        for (&size, offsets) in &self.buckets {
            if !size.is_power_of_two() || size < self.min_size || size >= self.allocated_size {
                return Err(Error::FreelistInconsistent(format!(
                    "bucket key {} is invalid for min size {} and store size {}",
                    size, self.min_size, self.allocated_size
                )));
            }
            if offsets.is_empty() {
                return Err(Error::FreelistInconsistent(format!(
                    "bucket {} is empty",
                    size
                )));
            }
            for &offset in offsets {
                if offset % size != 0 || offset + size > self.allocated_size {
                    return Err(Error::FreelistInconsistent(format!(
                        "block {}+{} is misaligned or outside the {} byte store",
                        offset, size, self.allocated_size
                    )));
                }
                if self.is_parent_block_free(offset, size) {
                    return Err(Error::FreelistInconsistent(format!(
                        "block {}+{} and one of its ancestors are both free",
                        offset, size
                    )));
                }
            }
        }

        if self.largest != self.buckets.keys().next_back().copied().unwrap_or(0) {
            return Err(Error::FreelistInconsistent(format!(
                "largest free chunk {} is stale",
                self.largest
            )));
        }
        Ok(())
    }

    /// Offsets of every free block, as `(offset, size)` pairs sorted by offset
    pub fn blocks(&self) -> BTreeSet<(u64, u64)> {
        self.buckets
            .iter()
            .flat_map(|(&size, offsets)| offsets.iter().map(move |&offset| (offset, size)))
            .collect()
    }
}
