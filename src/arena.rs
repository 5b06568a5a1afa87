//! A compacting allocator over a fixed arena of machine words.
//!
//! The arena is one contiguous byte region, split at runtime into two
//! parts that grow toward each other:
//!
//! - From the base upward, a chain of **blocks**. Every block starts with
//!   a one-word header whose top bit is the in-use flag and whose
//!   remaining bits count the payload words that follow. Blocks tile the
//!   region with no gaps, so the chain is walked purely by header
//!   arithmetic.
//! - From the top downward, the **handle table**: one word per live
//!   allocation, holding the offset of the block it names, or [`NIL`] for
//!   a tombstone left behind by a free.
//!
//! Callers never see block offsets. [`alloc`](Arena::alloc) returns a
//! [`Handle`], which is the offset of a table slot; payload access always
//! indirects through the slot, so [`defrag`](Arena::defrag) can slide
//! blocks around and only has to rewrite the table.
//!
//! Free blocks are found first-fit from the base. A block that satisfies
//! a request is split whenever any residual words remain, and frees
//! coalesce eagerly with both neighbors, so two adjacent free blocks
//! never coexist.

use core::fmt;

use log::debug;
use static_assertions::const_assert;
use thiserror::Error;

/// Machine word size. Header math and the handle table assume this.
pub const WORD: usize = core::mem::size_of::<usize>();
const_assert!(core::mem::size_of::<usize>() == 8);

/// In-use flag, stored in the top bit of a block header.
const FLAG: usize = 1 << (usize::BITS - 1);

/// Tombstone value for an empty handle-table slot.
const NIL: usize = usize::MAX;

/// The smallest usable arena: one header, one payload word, one slot.
const MIN_BYTES: usize = 3 * WORD;

/// Broad failure categories, for callers that dispatch on the class of
/// failure rather than the specific variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// No free block or handle slot can satisfy the request.
    NoMemory,
    /// The arena metadata is inconsistent; this is a bug, not a caller
    /// error.
    Internal,
    /// A handle was used after the allocation it named was freed.
    InvalidOperation,
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("arena of {size} bytes is smaller than the {MIN_BYTES}-byte minimum")]
    TooSmall { size: usize },
    #[error("no free block can hold {needed} bytes")]
    NoMemory { needed: usize },
    #[error("no room left for a handle slot")]
    NoHandleSlot,
    #[error("handle used after free")]
    UseAfterFree,
    #[error("arena metadata corrupt: {0}")]
    Corrupt(&'static str),
}

impl ArenaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArenaError::TooSmall { .. }
            | ArenaError::NoMemory { .. }
            | ArenaError::NoHandleSlot => ErrorKind::NoMemory,
            ArenaError::UseAfterFree => ErrorKind::InvalidOperation,
            ArenaError::Corrupt(_) => ErrorKind::Internal,
        }
    }
}

/// A relocation-proof reference to an allocation.
///
/// A `Handle` names a handle-table slot, not a block, so it stays valid
/// across [`Arena::defrag`] and moving reallocs. The null handle is what
/// zero-byte allocations return; it dereferences to an empty slice.
///
/// Handles are plain copyable tokens. Freeing through one copy turns all
/// other copies stale; dereferencing a stale handle fails with
/// [`ArenaError::UseAfterFree`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Handle {
    slot: Option<usize>,
}

impl Handle {
    /// The handle returned for zero-byte allocations.
    pub const NULL: Handle = Handle { slot: None };

    pub fn is_null(&self) -> bool {
        self.slot.is_none()
    }
}

/// Counts of inconsistencies found by a [`stats`](Arena::stats) walk.
///
/// All fields should always be zero; anything else indicates a bug in the
/// allocator itself.
#[derive(Debug, Default)]
pub struct Validity {
    /// Free blocks directly adjacent to another free block. Coalescing
    /// should have merged these.
    pub adjacent_free: usize,
    /// Blocks whose header claims words past the handle-table base.
    pub header_overrun: usize,
    /// In-use blocks not named by exactly one table slot.
    pub slot_mismatch: usize,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.adjacent_free == 0 && self.header_overrun == 0 && self.slot_mismatch == 0
    }
}

/// Occupancy counters from a [`stats`](Arena::stats) walk. Word counts
/// include block headers.
#[derive(Debug, Default)]
pub struct Stats {
    pub blocks: usize,
    pub used_words: usize,
    pub free_words: usize,
    pub live_slots: usize,
    pub tombstones: usize,
}

/// A fixed arena of words with a compacting, handle-based allocator on
/// top.
pub struct Arena {
    mem: Box<[u8]>,
    /// Total words managed, table included.
    words: usize,
    /// Offset of the last block in the chain.
    last: usize,
    /// Offset of the lowest handle-table slot; the table is
    /// `table_base..words`.
    table_base: usize,
}

impl Arena {
    /// Creates an arena managing `size_bytes` of fresh memory.
    ///
    /// The region initially holds a single free block covering everything
    /// below the (empty) handle table. Sizes below three words are
    /// rejected; trailing bytes beyond the last whole word are unused.
    pub fn new(size_bytes: usize) -> Result<Self, ArenaError> {
        if size_bytes < MIN_BYTES {
            return Err(ArenaError::TooSmall { size: size_bytes });
        }

        let words = size_bytes / WORD;
        let mut arena = Arena {
            mem: vec![0u8; size_bytes].into_boxed_slice(),
            words,
            last: 0,
            table_base: words,
        };
        arena.set_header(0, false, words - 1);
        Ok(arena)
    }

    /// Allocates a block with at least `n_bytes` of payload and returns a
    /// handle to it.
    ///
    /// Zero-byte requests consume nothing and return the null handle. On
    /// failure the arena is left exactly as it was.
    pub fn alloc(&mut self, n_bytes: usize) -> Result<Handle, ArenaError> {
        if n_bytes == 0 {
            return Ok(Handle::NULL);
        }

        let placed = self.place_slot()?;
        let block = match self.find_free(n_bytes) {
            Some(block) => block,
            None => {
                self.unplace_slot(placed);
                return Err(ArenaError::NoMemory { needed: n_bytes });
            }
        };

        self.carve(block, n_bytes);
        self.set_word(placed.slot, block);
        debug!("alloc({}) -> block {} via slot {}", n_bytes, block, placed.slot);
        Ok(Handle { slot: Some(placed.slot) })
    }

    /// Resizes the allocation behind `handle` to `n_bytes`.
    ///
    /// In order of preference: a null handle delegates to
    /// [`alloc`](Arena::alloc); a block that already covers the request is
    /// shrunk in place; a free right neighbor with enough combined room is
    /// absorbed; otherwise the payload is copied into a fresh block and
    /// the old one freed. The handle itself never changes.
    pub fn realloc(&mut self, handle: &mut Handle, n_bytes: usize) -> Result<(), ArenaError> {
        let slot = match handle.slot {
            None => {
                *handle = self.alloc(n_bytes)?;
                return Ok(());
            }
            Some(slot) => slot,
        };

        let block = self.slot_block(slot)?;
        let len = self.header_len(block);

        if len * WORD >= n_bytes {
            // Shrink in place; carve releases the tail words.
            self.carve(block, n_bytes);
            return Ok(());
        }

        if block != self.last {
            let next = self.next_block(block);
            if !self.header_used(next) {
                let avail = (len + self.header_len(next) + 1) * WORD;
                if avail >= n_bytes {
                    self.absorb(block, next, n_bytes);
                    return Ok(());
                }
            }
        }

        let dst = self
            .find_free(n_bytes)
            .ok_or(ArenaError::NoMemory { needed: n_bytes })?;

        // Copy the old payload, then retire the old block. The
        // destination is flagged in use first so the release cannot
        // coalesce into it.
        let src_bytes = (block + 1) * WORD;
        let dst_bytes = (dst + 1) * WORD;
        self.mem
            .copy_within(src_bytes..src_bytes + len * WORD, dst_bytes);

        let dst_len = self.header_len(dst);
        self.set_header(dst, true, dst_len);
        self.release(block);
        self.carve(dst, n_bytes);
        self.set_word(slot, dst);
        debug!("realloc({}) moved block {} -> {}", n_bytes, block, dst);
        Ok(())
    }

    /// Frees the allocation behind `handle`.
    ///
    /// The block is marked free and coalesced with free neighbors, the
    /// table slot becomes a tombstone, and tombstones adjacent to the
    /// table edge are handed back to the trailing free block. A null or
    /// already-stale handle is a no-op.
    pub fn free(&mut self, handle: &mut Handle) {
        let slot = match handle.slot.take() {
            None => return,
            Some(slot) => slot,
        };
        if slot < self.table_base || slot >= self.words {
            return;
        }

        let block = self.word(slot);
        if block == NIL {
            return;
        }

        self.release(block);
        self.set_word(slot, NIL);
        self.squeeze_table();
        debug!("free: block {} via slot {}", block, slot);
    }

    /// Compacts the arena: every in-use block slides down to the lowest
    /// free position, in address order, and its table slot is rewritten
    /// in lockstep. Afterwards all free space is one block at the top of
    /// the chain. Handles are unaffected.
    pub fn defrag(&mut self) {
        let mut dst = 0;
        let mut src = 0;
        let mut last_used = None;

        while src < self.table_base {
            let len = self.header_len(src);
            let next = src + 1 + len;
            if self.header_used(src) {
                if src != dst {
                    let src_bytes = src * WORD;
                    self.mem
                        .copy_within(src_bytes..src_bytes + (len + 1) * WORD, dst * WORD);
                    self.rewrite_slot(src, dst);
                }
                last_used = Some(dst);
                dst += len + 1;
            }
            src = next;
        }

        if dst < self.table_base {
            self.set_header(dst, false, self.table_base - dst - 1);
            self.last = dst;
        } else {
            self.last = last_used.unwrap_or(0);
        }
        debug!("defrag: compacted to {} words, last block at {}", dst, self.last);
    }

    /// The current payload of `handle`, padded up to whole words.
    ///
    /// The null handle yields an empty slice. A handle whose allocation
    /// was freed fails with [`ArenaError::UseAfterFree`].
    pub fn data(&self, handle: &Handle) -> Result<&[u8], ArenaError> {
        let slot = match handle.slot {
            None => return Ok(&[]),
            Some(slot) => slot,
        };
        let block = self.slot_block(slot)?;
        let start = (block + 1) * WORD;
        Ok(&self.mem[start..start + self.header_len(block) * WORD])
    }

    /// Mutable access to the payload of `handle`. Same rules as
    /// [`data`](Arena::data).
    pub fn data_mut(&mut self, handle: &Handle) -> Result<&mut [u8], ArenaError> {
        let slot = match handle.slot {
            None => return Ok(&mut []),
            Some(slot) => slot,
        };
        let block = self.slot_block(slot)?;
        let len = self.header_len(block);
        let start = (block + 1) * WORD;
        Ok(&mut self.mem[start..start + len * WORD])
    }

    /// Walks the block chain and handle table, reporting occupancy and
    /// any inconsistencies.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        let mut block = 0;
        let mut prev_free = false;
        while block < self.table_base {
            let len = self.header_len(block);
            let next = block + 1 + len;
            if next > self.table_base {
                validity.header_overrun += 1;
                break;
            }
            stats.blocks += 1;
            if self.header_used(block) {
                stats.used_words += len + 1;
                let naming = (self.table_base..self.words)
                    .filter(|&slot| self.word(slot) == block)
                    .count();
                if naming != 1 {
                    validity.slot_mismatch += 1;
                }
                prev_free = false;
            } else {
                stats.free_words += len + 1;
                if prev_free {
                    validity.adjacent_free += 1;
                }
                prev_free = true;
            }
            block = next;
        }

        for slot in self.table_base..self.words {
            if self.word(slot) == NIL {
                stats.tombstones += 1;
            } else {
                stats.live_slots += 1;
            }
        }

        (validity, stats)
    }

    /// Total words managed, handle table included.
    pub fn words(&self) -> usize {
        self.words
    }

    /// Words currently occupied by the handle table.
    pub fn table_words(&self) -> usize {
        self.words - self.table_base
    }

    ////////////////////////////////////////////////////////////
    // Word and header accessors

    fn word(&self, idx: usize) -> usize {
        let at = idx * WORD;
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(&self.mem[at..at + WORD]);
        usize::from_ne_bytes(raw)
    }

    fn set_word(&mut self, idx: usize, value: usize) {
        let at = idx * WORD;
        self.mem[at..at + WORD].copy_from_slice(&value.to_ne_bytes());
    }

    fn header_used(&self, block: usize) -> bool {
        self.word(block) & FLAG != 0
    }

    fn header_len(&self, block: usize) -> usize {
        self.word(block) & !FLAG
    }

    fn set_header(&mut self, block: usize, used: bool, len: usize) {
        assert!(len & FLAG == 0, "block length overlaps the in-use flag");
        self.set_word(block, if used { len | FLAG } else { len });
    }

    fn next_block(&self, block: usize) -> usize {
        block + 1 + self.header_len(block)
    }

    /// Resolves a table slot to the in-use block it names.
    fn slot_block(&self, slot: usize) -> Result<usize, ArenaError> {
        if slot < self.table_base || slot >= self.words {
            // The slot was reclaimed when the table shrank.
            return Err(ArenaError::UseAfterFree);
        }
        let block = self.word(slot);
        if block == NIL {
            return Err(ArenaError::UseAfterFree);
        }
        if block >= self.table_base {
            return Err(ArenaError::Corrupt("slot names an offset past the table base"));
        }
        if !self.header_used(block) {
            return Err(ArenaError::UseAfterFree);
        }
        Ok(block)
    }

    ////////////////////////////////////////////////////////////
    // Handle-table maintenance

    /// Claims a table slot: a tombstone if one exists, otherwise a fresh
    /// word taken from the trailing free block.
    fn place_slot(&mut self) -> Result<PlacedSlot, ArenaError> {
        for slot in (self.table_base..self.words).rev() {
            if self.word(slot) == NIL {
                return Ok(PlacedSlot { slot, grew: false });
            }
        }

        // Growing the table eats one word off the end of the chain, which
        // must be a free block with at least one payload word to give.
        if self.header_used(self.last) || self.header_len(self.last) == 0 {
            return Err(ArenaError::NoHandleSlot);
        }
        let len = self.header_len(self.last);
        self.set_header(self.last, false, len - 1);
        self.table_base -= 1;
        self.set_word(self.table_base, NIL);
        Ok(PlacedSlot { slot: self.table_base, grew: true })
    }

    /// Rolls back [`place_slot`](Arena::place_slot) after a failed block
    /// search, so a failed alloc leaves no trace.
    fn unplace_slot(&mut self, placed: PlacedSlot) {
        if placed.grew {
            self.table_base += 1;
            let len = self.header_len(self.last);
            self.set_header(self.last, false, len + 1);
        }
    }

    /// Reclaims tombstones adjacent to the table edge; the trailing free
    /// block absorbs the recovered words.
    fn squeeze_table(&mut self) {
        let mut reclaimed = 0;
        while self.table_base < self.words && self.word(self.table_base) == NIL {
            self.table_base += 1;
            reclaimed += 1;
        }
        if reclaimed == 0 {
            return;
        }

        if self.header_used(self.last) {
            let block = self.next_block(self.last);
            self.set_header(block, false, reclaimed - 1);
            self.last = block;
        } else {
            let len = self.header_len(self.last);
            self.set_header(self.last, false, len + reclaimed);
        }
    }

    /// Rewrites the one slot naming `from` to name `to` instead.
    fn rewrite_slot(&mut self, from: usize, to: usize) {
        for slot in self.table_base..self.words {
            if self.word(slot) == from {
                self.set_word(slot, to);
                return;
            }
        }
        debug_assert!(false, "no slot names block {}", from);
    }

    ////////////////////////////////////////////////////////////
    // Block-chain maintenance

    /// First-fit scan for a free block with at least `n_bytes` of payload.
    fn find_free(&self, n_bytes: usize) -> Option<usize> {
        let mut block = 0;
        loop {
            if !self.header_used(block) && self.header_len(block) * WORD >= n_bytes {
                return Some(block);
            }
            if block == self.last {
                return None;
            }
            block = self.next_block(block);
        }
    }

    /// Marks `block` in use with `n_bytes` of payload, splitting off the
    /// residual words as a free tail. The tail merges with a free right
    /// neighbor, which appears when this is a shrink-in-place.
    ///
    /// The block's current length must cover the request.
    fn carve(&mut self, block: usize, n_bytes: usize) {
        let need = words_for(n_bytes);
        let len = self.header_len(block);
        debug_assert!(need <= len);

        let residual = len - need;
        if residual > 0 {
            let tail = block + need + 1;
            self.set_header(tail, false, residual - 1);
            if block == self.last {
                self.last = tail;
            } else {
                let after = self.next_block(tail);
                if !self.header_used(after) {
                    let merged = (residual - 1) + self.header_len(after) + 1;
                    self.set_header(tail, false, merged);
                    if after == self.last {
                        self.last = tail;
                    }
                }
            }
        }
        self.set_header(block, true, need);
    }

    /// Grows `block` in place by absorbing its free right neighbor
    /// `next`, leaving any leftover words as a new free tail.
    fn absorb(&mut self, block: usize, next: usize, n_bytes: usize) {
        let need = words_for(n_bytes);
        let total = self.header_len(block) + 1 + self.header_len(next);
        debug_assert!(need <= total);
        let next_was_last = next == self.last;

        let leftover = total - need;
        if leftover > 0 {
            let tail = block + need + 1;
            self.set_header(tail, false, leftover - 1);
            if next_was_last {
                self.last = tail;
            }
        } else if next_was_last {
            self.last = block;
        }
        self.set_header(block, true, need);
    }

    /// Marks `block` free and coalesces it with free neighbors on both
    /// sides. The left neighbor is found by walking from the base; blocks
    /// carry no back links.
    fn release(&mut self, block: usize) {
        let len = self.header_len(block);
        self.set_header(block, false, len);

        let mut block = block;
        if block != 0 {
            let mut prev = 0;
            while self.next_block(prev) != block {
                prev = self.next_block(prev);
            }
            if !self.header_used(prev) {
                let merged = self.header_len(prev) + self.header_len(block) + 1;
                self.set_header(prev, false, merged);
                if block == self.last {
                    self.last = prev;
                }
                block = prev;
            }
        }

        if block != self.last {
            let next = self.next_block(block);
            if !self.header_used(next) {
                if next == self.last {
                    self.last = block;
                }
                let merged = self.header_len(block) + self.header_len(next) + 1;
                self.set_header(block, false, merged);
            }
        }
    }
}

struct PlacedSlot {
    slot: usize,
    grew: bool,
}

/// Payload words needed to hold `n_bytes`.
fn words_for(n_bytes: usize) -> usize {
    (n_bytes + WORD - 1) / WORD
}

impl fmt::Display for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arena(")?;
        let mut block = 0;
        let mut start = true;
        while block < self.table_base {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let state = if self.header_used(block) { "Used" } else { "Free" };
            write!(f, "{}({}, {})", state, block, self.header_len(block))?;
            block = self.next_block(block);
        }
        let (live, dead) = {
            let (_, stats) = self.stats();
            (stats.live_slots, stats.tombstones)
        };
        write!(f, "; {} handles, {} tombstones)", live, dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    /// Word accounting must balance at every step: blocks tile the region
    /// below the table exactly, and no two free blocks touch.
    fn validate(arena: &Arena) {
        let (validity, stats) = arena.stats();
        log::info!("{} / {:?} {:?}", arena, validity, stats);
        assert!(validity.is_valid());
        assert_eq!(
            stats.used_words + stats.free_words + stats.live_slots + stats.tombstones,
            arena.words()
        );
    }

    #[test]
    fn rejects_tiny_arenas() {
        assert!(matches!(
            Arena::new(2 * WORD),
            Err(ArenaError::TooSmall { .. })
        ));
        assert!(Arena::new(3 * WORD).is_ok());
    }

    #[test]
    fn zero_byte_alloc_is_null() {
        let mut arena = Arena::new(512).unwrap();
        let h = arena.alloc(0).unwrap();
        assert!(h.is_null());
        assert_eq!(arena.data(&h).unwrap(), &[] as &[u8]);
        assert_eq!(arena.table_words(), 0);
    }

    #[test]
    fn alloc_write_read() {
        let mut arena = Arena::new(512).unwrap();
        let h = arena.alloc(10).unwrap();
        validate(&arena);

        arena.data_mut(&h).unwrap()[..10].copy_from_slice(b"0123456789");
        assert_eq!(&arena.data(&h).unwrap()[..10], b"0123456789");
        // Padded up to whole words.
        assert_eq!(arena.data(&h).unwrap().len(), 16);
    }

    #[test]
    fn exhaustion_is_clean() {
        let mut arena = Arena::new(8 * WORD).unwrap();
        // 8 words: after one slot there are 7 left for the chain.
        let h = arena.alloc(5 * WORD).unwrap();
        validate(&arena);

        let err = arena.alloc(4 * WORD).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMemory);
        // The failed call must not have leaked a slot.
        assert_eq!(arena.table_words(), 1);
        validate(&arena);

        let _ = h;
    }

    #[test]
    fn free_coalesces_both_sides() {
        let mut arena = Arena::new(64 * WORD).unwrap();
        let mut a = arena.alloc(8).unwrap();
        let mut b = arena.alloc(8).unwrap();
        let mut c = arena.alloc(8).unwrap();
        validate(&arena);

        arena.free(&mut a);
        validate(&arena);
        arena.free(&mut c);
        validate(&arena);
        // Freeing the middle block must fuse all three regions into one.
        arena.free(&mut b);
        validate(&arena);

        let (_, stats) = arena.stats();
        assert_eq!(stats.blocks, 1);
    }

    #[test]
    fn freed_handle_is_rejected() {
        let mut arena = Arena::new(512).unwrap();
        let mut h = arena.alloc(16).unwrap();
        let stale = h;
        arena.free(&mut h);

        let err = arena.data(&stale).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn shrink_in_place_keeps_prefix() {
        // Arena scenario: 16 bytes written, shrunk to 8, prefix intact
        // and the trailing free block one word bigger.
        let mut arena = Arena::new(64 * WORD).unwrap();
        let mut h = arena.alloc(16).unwrap();
        arena.data_mut(&h).unwrap().fill(0xAA);

        let (_, before) = arena.stats();
        arena.realloc(&mut h, 8).unwrap();
        let (_, after) = arena.stats();
        validate(&arena);

        assert_eq!(arena.data(&h).unwrap(), &[0xAA; 8]);
        assert_eq!(after.free_words, before.free_words + 1);
    }

    #[test]
    fn grow_absorbs_free_neighbor() {
        let mut arena = Arena::new(64 * WORD).unwrap();
        let mut a = arena.alloc(8).unwrap();
        let mut b = arena.alloc(8).unwrap();
        let keep = arena.alloc(8).unwrap();
        arena.data_mut(&a).unwrap().fill(0x42);
        arena.free(&mut b);
        validate(&arena);

        // a's right neighbor is free: growing must happen in place.
        arena.realloc(&mut a, 16).unwrap();
        validate(&arena);
        assert_eq!(&arena.data(&a).unwrap()[..8], &[0x42; 8]);
        assert_eq!(arena.data(&a).unwrap().len(), 16);

        let _ = keep;
    }

    #[test]
    fn moving_realloc_carries_payload() {
        let mut arena = Arena::new(64 * WORD).unwrap();
        let mut a = arena.alloc(8).unwrap();
        let fence = arena.alloc(8).unwrap();
        arena.data_mut(&a).unwrap().fill(0x17);

        // A used right neighbor forces the grow to relocate.
        arena.realloc(&mut a, 64).unwrap();
        validate(&arena);
        assert_eq!(&arena.data(&a).unwrap()[..8], &[0x17; 8]);

        let _ = fence;
    }

    #[test]
    fn defrag_is_idempotent() {
        let mut arena = Arena::new(64 * WORD).unwrap();
        let mut handles: Vec<_> = (0..6).map(|_| arena.alloc(24).unwrap()).collect();
        for h in handles.iter().skip(1).step_by(2) {
            let mut h = *h;
            arena.free(&mut h);
        }
        handles.retain(|h| arena.data(h).is_ok());

        arena.defrag();
        validate(&arena);
        let first = format!("{}", arena);
        arena.defrag();
        validate(&arena);
        assert_eq!(first, format!("{}", arena));
    }

    #[test]
    fn tombstones_are_reused_then_reclaimed() {
        let mut arena = Arena::new(64 * WORD).unwrap();
        let mut gone = arena.alloc(8).unwrap();
        let keep = arena.alloc(8).unwrap();
        assert_eq!(arena.table_words(), 2);

        // The freed slot sits above a live one, away from the table edge,
        // so it lingers as a tombstone...
        arena.free(&mut gone);
        let (_, stats) = arena.stats();
        assert_eq!(stats.tombstones, 1);

        // ...until the next alloc takes it over instead of growing.
        let reused = arena.alloc(8).unwrap();
        assert_eq!(arena.table_words(), 2);
        let (_, stats) = arena.stats();
        assert_eq!(stats.tombstones, 0);
        validate(&arena);

        let _ = (keep, reused);
    }

    #[test]
    fn edge_tombstones_return_their_words() {
        let mut arena = Arena::new(64 * WORD).unwrap();
        let first = arena.alloc(8).unwrap();
        let mut edge = arena.alloc(8).unwrap();

        // The youngest slot is the table edge; freeing it hands the word
        // straight back to the trailing free block.
        arena.free(&mut edge);
        assert_eq!(arena.table_words(), 1);
        validate(&arena);

        let _ = first;
    }
}
