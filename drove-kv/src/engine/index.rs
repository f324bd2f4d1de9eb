//! Bucket-chained hash index.
//!
//! An array of power-of-two many buckets, each a small set-associative group
//! of (tag, log offset) entries. Within a bucket, replacement is FIFO: a
//! cursor walks the ways in order, so the oldest insertion is displaced
//! first. Tag matches overwrite in place without moving the cursor.
use super::log::LogOffset;
use color_eyre::eyre::{ensure, Result};

pub const BUCKET_WAYS: usize = 8;

const EMPTY_OFFSET: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    tag: u64,
    offset: u64,
}

impl IndexEntry {
    const fn empty() -> Self {
        IndexEntry {
            tag: 0,
            offset: EMPTY_OFFSET,
        }
    }

    fn is_empty(&self) -> bool {
        self.offset == EMPTY_OFFSET
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    entries: [IndexEntry; BUCKET_WAYS],
    next_evict: u8,
}

pub struct BucketIndex {
    buckets: Vec<Bucket>,
    mask: usize,
}

impl BucketIndex {
    pub fn new(num_buckets: usize) -> Result<Self> {
        ensure!(
            num_buckets.is_power_of_two(),
            "Bucket count {} must be a power of two",
            num_buckets
        );
        Ok(BucketIndex {
            buckets: vec![
                Bucket {
                    entries: [IndexEntry::empty(); BUCKET_WAYS],
                    next_evict: 0,
                };
                num_buckets
            ],
            mask: num_buckets - 1,
        })
    }

    #[inline]
    fn bucket_of(&self, bucket_field: u32) -> usize {
        bucket_field as usize & self.mask
    }

    pub fn insert(&mut self, bucket_field: u32, tag: u64, offset: LogOffset) {
        let idx = self.bucket_of(bucket_field);
        let bucket = &mut self.buckets[idx];
        for entry in bucket.entries.iter_mut() {
            if !entry.is_empty() && entry.tag == tag {
                entry.offset = offset;
                return;
            }
        }
        let way = bucket.next_evict as usize;
        bucket.entries[way] = IndexEntry { tag, offset };
        bucket.next_evict = ((way + 1) % BUCKET_WAYS) as u8;
    }

    pub fn lookup(&self, bucket_field: u32, tag: u64) -> Option<LogOffset> {
        let bucket = &self.buckets[self.bucket_of(bucket_field)];
        bucket
            .entries
            .iter()
            .find(|e| !e.is_empty() && e.tag == tag)
            .map(|e| e.offset)
    }

    /// Drop the entry for `tag`, used when a lookup found it lapsed.
    pub fn invalidate(&mut self, bucket_field: u32, tag: u64) {
        let idx = self.bucket_of(bucket_field);
        let bucket = &mut self.buckets[idx];
        for entry in bucket.entries.iter_mut() {
            if !entry.is_empty() && entry.tag == tag {
                *entry = IndexEntry::empty();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_invalidate() {
        let mut index = BucketIndex::new(8).unwrap();
        index.insert(3, 100, 5);
        assert_eq!(index.lookup(3, 100), Some(5));
        assert_eq!(index.lookup(3, 101), None);
        index.invalidate(3, 100);
        assert_eq!(index.lookup(3, 100), None);
    }

    #[test]
    fn tag_match_overwrites_in_place() {
        let mut index = BucketIndex::new(8).unwrap();
        index.insert(1, 42, 10);
        index.insert(1, 42, 20);
        assert_eq!(index.lookup(1, 42), Some(20));
    }

    #[test]
    fn bucket_selection_uses_low_bits() {
        let mut index = BucketIndex::new(4).unwrap();
        // bucket fields 2 and 6 collide in a 4-bucket index
        index.insert(2, 7, 1);
        index.insert(6, 8, 2);
        assert_eq!(index.lookup(2, 7), Some(1));
        assert_eq!(index.lookup(6, 8), Some(2));
    }

    #[test]
    fn fifo_eviction_displaces_oldest() {
        let mut index = BucketIndex::new(2).unwrap();
        for tag in 0..BUCKET_WAYS as u64 {
            index.insert(0, tag, tag);
        }
        // Bucket full; next insert evicts tag 0, the oldest.
        index.insert(0, 99, 99);
        assert_eq!(index.lookup(0, 0), None);
        assert_eq!(index.lookup(0, 99), Some(99));
        for tag in 1..BUCKET_WAYS as u64 {
            assert_eq!(index.lookup(0, tag), Some(tag));
        }
        // And the following insert evicts tag 1.
        index.insert(0, 98, 98);
        assert_eq!(index.lookup(0, 1), None);
    }

    #[test]
    fn non_power_of_two_rejected() {
        assert!(BucketIndex::new(12).is_err());
    }
}
