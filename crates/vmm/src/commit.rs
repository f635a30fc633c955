//! Commit tracking for intermediate page tables.
//!
//! Every address space records, per intermediate level, which tables have been backed by a
//! committed, zeroed frame and linked into the table above. The records are bitsets indexed
//! by the table's position within the half of the address space the space owns.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::{PAGE_SIZE, VirtualAddress, entry::Level};

/// Drops bit 47 so both halves index from zero.
const COMMIT_MASK: usize = 0x0000_7FFF_FFFF_F000;

/// Bits per lazily allocated chunk (one page worth of bits).
const CHUNK_BITS: usize = PAGE_SIZE * 8;
const CHUNK_WORDS: usize = CHUNK_BITS / 64;

/// A sparse bitset whose storage is allocated one page-sized chunk at a time.
pub struct CommitBitset {
    capacity: usize,
    chunks: BTreeMap<usize, Box<[u64; CHUNK_WORDS]>>,
}

impl CommitBitset {
    /// Creates an empty bitset able to hold `capacity` bits.
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            chunks: BTreeMap::new(),
        }
    }

    /// Returns whether bit `index` is set.
    pub fn contains(&self, index: usize) -> bool {
        self.check(index);
        self.chunks
            .get(&(index / CHUNK_BITS))
            .is_some_and(|chunk| chunk[(index % CHUNK_BITS) / 64] & (1 << (index % 64)) != 0)
    }

    /// Sets bit `index`, returning true if it was previously clear.
    pub fn insert(&mut self, index: usize) -> bool {
        self.check(index);
        let chunk = self
            .chunks
            .entry(index / CHUNK_BITS)
            .or_insert_with(|| Box::new([0; CHUNK_WORDS]));
        let word = &mut chunk[(index % CHUNK_BITS) / 64];
        let bit = 1 << (index % 64);
        let was_clear = *word & bit == 0;
        *word |= bit;
        was_clear
    }

    /// Returns the number of set bits.
    pub fn count(&self) -> usize {
        self.chunks
            .values()
            .flat_map(|chunk| chunk.iter())
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    /// Returns the number of chunks that have been allocated.
    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Clears every bit and releases the storage.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    fn check(&self, index: usize) {
        assert!(
            index < self.capacity,
            "commit bit {index:#x} out of range (capacity {:#x})",
            self.capacity
        );
    }
}

/// The three commit bitsets of one address space.
pub struct CommitTracker {
    l3: CommitBitset,
    l2: CommitBitset,
    l1: CommitBitset,
}

impl CommitTracker {
    pub fn new() -> Self {
        Self {
            l3: CommitBitset::new(256),
            l2: CommitBitset::new(256 * 512),
            l1: CommitBitset::new(256 * 512 * 512),
        }
    }

    /// Returns whether the `table`-level table covering `address` is committed.
    pub fn is_committed(&self, table: Level, address: VirtualAddress) -> bool {
        self.bitset(table).contains(Self::index(table, address.as_usize()))
    }

    /// Records the `table`-level table covering `address` as committed.
    ///
    /// Returns false if it already was.
    pub fn mark(&mut self, table: Level, address: VirtualAddress) -> bool {
        let index = Self::index(table, address.as_usize());
        self.bitset_mut(table).insert(index)
    }

    /// Returns how many `table`-level tables are committed.
    pub fn committed(&self, table: Level) -> usize {
        self.bitset(table).count()
    }

    /// Counts the tables of one level the range still needs.
    pub fn missing_at(&self, table: Level, start: VirtualAddress, pages: usize) -> usize {
        let bitset = self.bitset(table);
        tables_covering(table, start, pages)
            .filter(|&base| !bitset.contains(Self::index(table, base)))
            .count()
    }

    /// Counts the tables of every level the range still needs.
    pub fn missing(&self, start: VirtualAddress, pages: usize) -> usize {
        [Level::L3, Level::L2, Level::L1]
            .into_iter()
            .map(|table| self.missing_at(table, start, pages))
            .sum()
    }

    /// Forgets every commitment. Only valid once the tables themselves are gone.
    pub fn clear(&mut self) {
        self.l3.clear();
        self.l2.clear();
        self.l1.clear();
    }

    fn index(table: Level, address: usize) -> usize {
        (address & COMMIT_MASK) >> Self::covering(table).shift()
    }

    /// The level of the entry that points at a `table`-level table.
    fn covering(table: Level) -> Level {
        table
            .parent()
            .unwrap_or_else(|| panic!("the root table is not commit tracked"))
    }

    fn bitset(&self, table: Level) -> &CommitBitset {
        match table {
            Level::L3 => &self.l3,
            Level::L2 => &self.l2,
            Level::L1 => &self.l1,
            Level::L4 => panic!("the root table is not commit tracked"),
        }
    }

    fn bitset_mut(&mut self, table: Level) -> &mut CommitBitset {
        match table {
            Level::L3 => &mut self.l3,
            Level::L2 => &mut self.l2,
            Level::L1 => &mut self.l1,
            Level::L4 => panic!("the root table is not commit tracked"),
        }
    }
}

impl Default for CommitTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Yields the base address of every `table`-level table that maps part of the range.
pub(crate) fn tables_covering(
    table: Level,
    start: VirtualAddress,
    pages: usize,
) -> impl Iterator<Item = usize> {
    let span = CommitTracker::covering(table).span();
    let start = start.as_usize();
    let end = start.saturating_add(pages.saturating_mul(PAGE_SIZE));
    core::iter::successors(Some(start & !(span - 1)), move |base| base.checked_add(span))
        .take_while(move |&base| pages != 0 && base < end)
}
