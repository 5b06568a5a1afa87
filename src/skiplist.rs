//! An ordered map with a separated index layer over a sorted data list.
//!
//! The bottom layer is a singly-linked list of key/value nodes between a
//! head and a tail sentinel. Above it sit `H` layers of index nodes, each
//! holding only links: `next` along its own layer, `down` to the node one
//! layer below, and `root` to the data node its tower stands on. The head
//! sentinels form a full-height tower and a single tail index node
//! terminates every layer.
//!
//! A lookup descends the head tower, walking right while the next tower's
//! root key is less than the query, stepping down at each layer, and
//! finishing with a short walk along the data list. The whole descent is
//! recorded in a [`Path`] (per-layer predecessors, the highest layer where
//! the key matched, and the data-layer predecessor), which insert and
//! delete then patch without searching again.
//!
//! Towers are grown by fair coin flips on insert, one per layer, so a
//! tower reaches layer `l` with probability 2^-l and the expected cost of
//! every operation is O(log n).
//!
//! Nodes live in two internal slab arenas and refer to each other by
//! index, so the structure owns its keys and values outright and no
//! unsafe pointer graph is involved.

use std::fmt;
use std::io;

use log::trace;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::order::{Comparator, NaturalOrder};

/// Null link.
const NIL: usize = usize::MAX;
/// Slab id of the head data sentinel.
const HEAD: usize = 0;
/// Slab id of the tail data sentinel.
const TAIL: usize = 1;

struct DataNode<K, V> {
    /// `None` only for the two sentinels.
    kv: Option<(K, V)>,
    next: usize,
}

struct IndexNode {
    /// Index node one layer below, or the data node when on layer 0.
    down: usize,
    /// The data node this tower stands on.
    root: usize,
    next: usize,
}

/// A search transcript: everything needed to patch links at the position
/// where a key is or would be.
struct Path<const H: usize> {
    /// Predecessor index node per layer.
    preds: [usize; H],
    /// Highest layer where an index node matched the key, if any.
    match_at: Option<usize>,
    /// Data-layer predecessor of the key position.
    pred_data: usize,
}

/// An ordered map: sorted data list plus `H` index layers.
///
/// `C` supplies the strict-weak ordering; equality of keys is derived
/// from it. The promotion coin comes from a [`SmallRng`], seedable via
/// [`with_seed`](SkipList::with_seed) for reproducible layouts.
pub struct SkipList<K, V, C = NaturalOrder, const H: usize = 8> {
    data: Slab<DataNode<K, V>>,
    index: Slab<IndexNode>,
    head_tower: [usize; H],
    tail_idx: usize,
    len: usize,
    cmp: C,
    rng: SmallRng,
}

impl<K, V, C: Comparator<K> + Default, const H: usize> Default for SkipList<K, V, C, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C: Comparator<K> + Default, const H: usize> SkipList<K, V, C, H> {
    /// Creates an empty list with an entropy-seeded coin.
    pub fn new() -> Self {
        Self::with_parts(C::default(), SmallRng::from_entropy())
    }

    /// Creates an empty list whose promotion coin is seeded with `seed`,
    /// for reproducible tower layouts.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_parts(C::default(), SmallRng::seed_from_u64(seed))
    }
}

impl<K, V, C: Comparator<K>, const H: usize> SkipList<K, V, C, H> {
    /// Creates an empty list with an explicit comparator.
    pub fn with_comparator(cmp: C) -> Self {
        Self::with_parts(cmp, SmallRng::from_entropy())
    }

    fn with_parts(cmp: C, rng: SmallRng) -> Self {
        assert!(H >= 1, "a skiplist needs at least one index layer");

        let mut data = Slab::new();
        let head = data.insert(DataNode { kv: None, next: NIL });
        let tail = data.insert(DataNode { kv: None, next: NIL });
        debug_assert_eq!((head, tail), (HEAD, TAIL));
        data.get_mut(HEAD).next = TAIL;

        let mut index = Slab::new();
        let tail_idx = index.insert(IndexNode { down: TAIL, root: TAIL, next: NIL });

        let mut head_tower = [NIL; H];
        let mut below = HEAD;
        for slot in head_tower.iter_mut() {
            *slot = index.insert(IndexNode { down: below, root: HEAD, next: tail_idx });
            below = *slot;
        }

        SkipList { data, index, head_tower, tail_idx, len: 0, cmp, rng }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Associates `value` with `key`, returning the value it displaces if
    /// the key was already present.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        let (found, path) = self.search(&key);
        if found {
            let target = self.data.get(path.pred_data).next;
            let kv = self
                .data
                .get_mut(target)
                .kv
                .as_mut()
                .expect("matched node is not a sentinel");
            return Some(std::mem::replace(&mut kv.1, value));
        }
        self.insert_at(&path, key, value);
        None
    }

    /// Inserts only if `key` is absent. On a match the existing value is
    /// returned and the arguments are dropped untouched.
    pub fn put_if_absent(&mut self, key: K, value: V) -> Option<&V> {
        let (found, path) = self.search(&key);
        if found {
            let target = self.data.get(path.pred_data).next;
            return self.data.get(target).kv.as_ref().map(|(_, v)| v);
        }
        self.insert_at(&path, key, value);
        None
    }

    /// Looks up the value associated with `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let (found, path) = self.search(key);
        if !found {
            return None;
        }
        let target = self.data.get(path.pred_data).next;
        self.data.get(target).kv.as_ref().map(|(_, v)| v)
    }

    /// Removes `key`, unlinking its whole index tower, and returns the
    /// value it held.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let (found, path) = self.search(key);
        if !found {
            return None;
        }

        if let Some(top) = path.match_at {
            for level in 0..=top {
                let pred = path.preds[level];
                let doomed = self.index.get(pred).next;
                debug_assert_eq!(
                    self.index.get(doomed).root,
                    self.data.get(path.pred_data).next
                );
                let after = self.index.get(doomed).next;
                self.index.get_mut(pred).next = after;
                self.index.remove(doomed);
            }
        }

        let target = self.data.get(path.pred_data).next;
        let after = self.data.get(target).next;
        self.data.get_mut(path.pred_data).next = after;
        let node = self.data.remove(target);
        self.len -= 1;
        node.kv.map(|(_, v)| v)
    }

    /// Cursor over all entries in ascending key order.
    pub fn iter(&self) -> Iter<'_, K, V, C, H> {
        Iter { list: self, cur: self.data.get(HEAD).next }
    }

    /// Cursor starting at the first key not less than `min`.
    pub fn range_from(&self, min: &K) -> Iter<'_, K, V, C, H> {
        let (_, path) = self.search(min);
        Iter { list: self, cur: self.data.get(path.pred_data).next }
    }

    /// Dumps the layer structure as a graphviz digraph, for eyeballing
    /// tower shapes. The output format is a debugging aid, not stable.
    pub fn dot_dump<W: io::Write>(&self, w: &mut W) -> io::Result<()>
    where
        K: fmt::Display,
    {
        writeln!(w, "digraph SkipList {{")?;
        writeln!(w, "  rankdir=LR;")?;
        for level in (0..H).rev() {
            write!(w, "  {{ rank=same;")?;
            let mut cur = self.head_tower[level];
            while cur != self.tail_idx {
                write!(w, " i{};", cur)?;
                cur = self.index.get(cur).next;
            }
            writeln!(w, " }}")?;

            let mut cur = self.head_tower[level];
            while cur != self.tail_idx {
                let node = self.index.get(cur);
                writeln!(w, "  i{} -> i{};", cur, node.next)?;
                let down = if level == 0 { format!("d{}", node.down) } else { format!("i{}", node.down) };
                writeln!(w, "  i{} -> {};", cur, down)?;
                writeln!(w, "  i{} -> d{} [style=dotted];", cur, node.root)?;
                cur = node.next;
            }
        }

        let mut cur = HEAD;
        while cur != NIL {
            let node = self.data.get(cur);
            match &node.kv {
                Some((k, _)) => writeln!(w, "  d{} [label=\"{}\"];", cur, k)?,
                None => writeln!(w, "  d{} [label=\"·\"];", cur)?,
            }
            if node.next != NIL {
                writeln!(w, "  d{} -> d{};", cur, node.next)?;
            }
            cur = node.next;
        }
        writeln!(w, "}}")
    }

    /// Descends the tower and records the full search path.
    ///
    /// Returns whether the key is present; `path.pred_data.next` is then
    /// the matching node, and otherwise the position where the key would
    /// be inserted.
    fn search(&self, key: &K) -> (bool, Path<H>) {
        let mut preds = [NIL; H];
        let mut match_at = None;
        let mut found = false;

        let mut cur = self.head_tower[H - 1];
        for level in (0..H).rev() {
            let mut prev;
            loop {
                prev = cur;
                cur = self.index.get(cur).next;
                if cur == self.tail_idx {
                    break;
                }
                if !self.cmp.less(self.root_key(cur), key) {
                    break;
                }
            }

            if !found && cur != self.tail_idx && !self.cmp.less(key, self.root_key(cur)) {
                match_at = Some(level);
                found = true;
            }

            preds[level] = prev;
            if level > 0 {
                cur = self.index.get(prev).down;
            }
        }

        // Final walk along the data layer from the layer-0 predecessor.
        let mut dcur = self.index.get(preds[0]).down;
        let mut dprev;
        loop {
            dprev = dcur;
            dcur = self.data.get(dcur).next;
            if dcur == TAIL {
                break;
            }
            if !self.cmp.less(self.data_key(dcur), key) {
                break;
            }
        }

        let exact = found || (dcur != TAIL && !self.cmp.less(key, self.data_key(dcur)));
        (exact, Path { preds, match_at, pred_data: dprev })
    }

    /// Splices a fresh node in behind `path` and promotes it by coin
    /// flips, one independent trial per layer.
    fn insert_at(&mut self, path: &Path<H>, key: K, value: V) {
        debug_assert!(path.match_at.is_none());

        let next = self.data.get(path.pred_data).next;
        let new_data = self.data.insert(DataNode { kv: Some((key, value)), next });
        self.data.get_mut(path.pred_data).next = new_data;

        let mut below = new_data;
        let mut height = 0;
        for level in 0..H {
            if !self.rng.gen::<bool>() {
                break;
            }
            let pred = path.preds[level];
            let next = self.index.get(pred).next;
            let idx = self.index.insert(IndexNode { down: below, root: new_data, next });
            self.index.get_mut(pred).next = idx;
            below = idx;
            height = level + 1;
        }
        trace!("insert: data node {} with tower height {}", new_data, height);
        self.len += 1;
    }

    fn data_key(&self, id: usize) -> &K {
        match &self.data.get(id).kv {
            Some((k, _)) => k,
            None => unreachable!("sentinels are never compared"),
        }
    }

    fn root_key(&self, idx_id: usize) -> &K {
        self.data_key(self.index.get(idx_id).root)
    }
}

/// Forward cursor over `(key, value)` pairs in ascending order.
pub struct Iter<'a, K, V, C, const H: usize> {
    list: &'a SkipList<K, V, C, H>,
    cur: usize,
}

impl<'a, K, V, C: Comparator<K>, const H: usize> Iterator for Iter<'a, K, V, C, H> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == TAIL {
            return None;
        }
        let node = self.list.data.get(self.cur);
        self.cur = node.next;
        node.kv.as_ref().map(|(k, v)| (k, v))
    }
}

impl<'a, K, V, C: Comparator<K>, const H: usize> IntoIterator for &'a SkipList<K, V, C, H> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, C, H>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A minimal slab arena: id-addressed storage with an embedded free list,
/// so deleted nodes are recycled and links stay plain integers.
struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: usize,
}

enum Slot<T> {
    Occupied(T),
    Vacant { next_free: usize },
}

impl<T> Slab<T> {
    fn new() -> Self {
        Slab { slots: Vec::new(), free: NIL }
    }

    fn insert(&mut self, value: T) -> usize {
        if self.free != NIL {
            let id = self.free;
            match self.slots[id] {
                Slot::Vacant { next_free } => self.free = next_free,
                Slot::Occupied(_) => unreachable!("free list points at a live slot"),
            }
            self.slots[id] = Slot::Occupied(value);
            id
        } else {
            self.slots.push(Slot::Occupied(value));
            self.slots.len() - 1
        }
    }

    fn remove(&mut self, id: usize) -> T {
        let slot = std::mem::replace(&mut self.slots[id], Slot::Vacant { next_free: self.free });
        match slot {
            Slot::Occupied(value) => {
                self.free = id;
                value
            }
            Slot::Vacant { .. } => unreachable!("double remove from slab"),
        }
    }

    fn get(&self, id: usize) -> &T {
        match &self.slots[id] {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => unreachable!("stale link into slab"),
        }
    }

    fn get_mut(&mut self, id: usize) -> &mut T {
        match &mut self.slots[id] {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => unreachable!("stale link into slab"),
        }
    }
}
