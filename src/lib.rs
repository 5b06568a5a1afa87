//! Building blocks for low-level runtime engineering.
//!
//! This crate collects four independent cores, each a self-contained
//! exercise in classic systems machinery:
//!
//! ## [`arena`]
//!
//! A compacting allocator over a fixed arena of machine words. Callers
//! hold small [`arena::Handle`] tokens instead of addresses, so the whole
//! arena can be compacted ([`arena::Arena::defrag`]) without invalidating
//! anything.
//!
//! ## [`skiplist`]
//!
//! An ordered map with a separated index layer: a sorted data list under a
//! tower of express lanes, with probabilistic O(log n) insert, lookup,
//! delete and range scans.
//!
//! ## [`extsort`]
//!
//! A k-way external merge sorter for files that do not fit in memory,
//! built on the windowed record I/O of [`record_io`] and driven by a
//! bounded RAM budget. The `sorter` binary wraps it for the command line.
//!
//! ## [`coro`]
//!
//! A single-threaded stackful coroutine engine with buffered byte channels
//! for communication, on per-coroutine stacks from [`stack`].
//!
//! The cores do not depend on each other; [`order`] only hosts the
//! comparison trait the ordered components share.

pub mod arena;
#[cfg(unix)]
pub mod coro;
pub mod extsort;
pub mod order;
pub mod record_io;
pub mod skiplist;
#[cfg(unix)]
pub mod stack;

pub use arena::{Arena, Handle};
#[cfg(unix)]
pub use coro::Engine;
pub use extsort::extsort;
pub use order::{Comparator, NaturalOrder};
pub use skiplist::SkipList;
