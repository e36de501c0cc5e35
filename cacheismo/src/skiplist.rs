//! Ordered set of small (0..=255) size-class indices, used by the chunk
//! allocator (`chunkpool`) to find the smallest non-empty free-list class
//! larger than a requested class without scanning all 256 lists.
//!
//! Grounded on `original_source/src/common/skiplist.c`: node arena with a
//! freelist instead of per-op allocation, `MAX_SKIP_LEVEL` levels, a head
//! sentinel. The node arena itself reuses `crate::alloc::SlotPool`, the
//! index-based reclaim-queue allocator the teacher crate already carries
//! (`alloc.rs`), per spec §9's direction to express membership via indices
//! into an arena rather than intrusive pointers.

use crate::alloc::SlotPool;

const MAX_LEVEL: usize = 8;
const NULL: u32 = u32::max_value();

struct Node {
    value: u32,
    level: usize,
    forward: [u32; MAX_LEVEL],
}

/// Small xorshift PRNG so level generation doesn't need a `rand`
/// dependency on the hot allocation path (`rand` stays a dev-dependency
/// for benches/tests, matching the teacher's own Cargo.toml).
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    /// Coin flip used to decide whether a node grows another level.
    fn coin(&mut self) -> bool {
        self.next() & 1 == 0
    }
}

/// Ordered set of `u32` values with probabilistic skip-list indexing.
pub struct Skiplist {
    nodes: SlotPool<Node>,
    head: [u32; MAX_LEVEL],
    top_level: usize,
    len: usize,
    rng: Rng,
}

impl Skiplist {
    pub fn new() -> Self {
        Skiplist {
            nodes: SlotPool::new(),
            head: [NULL; MAX_LEVEL],
            top_level: 0,
            len: 0,
            rng: Rng(0x9e3779b9),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.coin() {
            level += 1;
        }
        level
    }

    /// Locate, per level, the last node whose value is strictly less than
    /// `value`. Used by both insert and delete to build the update chain.
    fn find_predecessors(&self, value: u32) -> [u32; MAX_LEVEL] {
        let mut update = [NULL; MAX_LEVEL];
        let mut cur = NULL;
        for lvl in (0..self.top_level.max(1)).rev() {
            let mut from = if cur == NULL { self.head[lvl] } else { self.nodes.get(cur as usize).unwrap().forward[lvl] };
            let mut node = cur;
            loop {
                match from {
                    NULL => break,
                    idx => {
                        let n = self.nodes.get(idx as usize).unwrap();
                        if n.value < value {
                            node = idx;
                            from = n.forward[lvl];
                        } else {
                            break;
                        }
                    }
                }
            }
            cur = node;
            update[lvl] = node;
        }
        update
    }

    fn forward_from(&self, node: u32, lvl: usize) -> u32 {
        if node == NULL {
            self.head[lvl]
        } else {
            self.nodes.get(node as usize).unwrap().forward[lvl]
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        let update = self.find_predecessors(value);
        let candidate = self.forward_from(update[0], 0);
        candidate != NULL && self.nodes.get(candidate as usize).unwrap().value == value
    }

    /// Insert `value`. No-op if already present (the allocator only ever
    /// inserts a class once it transitions from empty to non-empty).
    pub fn insert(&mut self, value: u32) {
        let update = self.find_predecessors(value);
        let existing = self.forward_from(update[0], 0);
        if existing != NULL && self.nodes.get(existing as usize).unwrap().value == value {
            return;
        }

        let level = self.random_level();
        if level > self.top_level {
            self.top_level = level;
        }

        let mut forward = [NULL; MAX_LEVEL];
        for lvl in 0..level {
            forward[lvl] = self.forward_from(update[lvl], lvl);
        }
        let index = self.nodes.push(Node { value, level, forward }) as u32;

        for lvl in 0..level {
            if update[lvl] == NULL {
                self.head[lvl] = index;
            } else {
                self.nodes.get_mut(update[lvl] as usize).unwrap().forward[lvl] = index;
            }
        }
        self.len += 1;
    }

    /// Remove `value` if present.
    pub fn delete(&mut self, value: u32) {
        let update = self.find_predecessors(value);
        let target = self.forward_from(update[0], 0);
        if target == NULL || self.nodes.get(target as usize).unwrap().value != value {
            return;
        }

        let level = self.nodes.get(target as usize).unwrap().level;
        for lvl in 0..level {
            let next = self.nodes.get(target as usize).unwrap().forward[lvl];
            if update[lvl] == NULL {
                self.head[lvl] = next;
            } else {
                self.nodes.get_mut(update[lvl] as usize).unwrap().forward[lvl] = next;
            }
        }
        self.nodes.reclaim(target as usize);
        self.len -= 1;
    }

    /// Smallest member strictly greater than `value`, if any.
    pub fn next_greater(&self, value: u32) -> Option<u32> {
        let update = self.find_predecessors(value + 1);
        let candidate = self.forward_from(update[0], 0);
        if candidate == NULL {
            None
        } else {
            Some(self.nodes.get(candidate as usize).unwrap().value)
        }
    }

    /// Largest member strictly less than `value`, if any.
    pub fn prev_less(&self, value: u32) -> Option<u32> {
        let update = self.find_predecessors(value);
        let pred = update[0];
        if pred == NULL {
            None
        } else {
            Some(self.nodes.get(pred as usize).unwrap().value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_contains() {
        let mut list = Skiplist::new();
        for v in [5u32, 1, 9, 3, 7].iter() {
            list.insert(*v);
        }
        assert_eq!(list.len(), 5);
        assert!(list.contains(5));
        assert!(!list.contains(4));
    }

    #[test]
    fn next_greater_and_prev_less() {
        let mut list = Skiplist::new();
        for v in [10u32, 20, 30, 40].iter() {
            list.insert(*v);
        }
        assert_eq!(list.next_greater(15), Some(20));
        assert_eq!(list.next_greater(40), None);
        assert_eq!(list.prev_less(25), Some(20));
        assert_eq!(list.prev_less(10), None);
    }

    #[test]
    fn delete_removes_and_frees_node() {
        let mut list = Skiplist::new();
        for v in [1u32, 2, 3].iter() {
            list.insert(*v);
        }
        list.delete(2);
        assert!(!list.contains(2));
        assert_eq!(list.len(), 2);
        // The freed slot is reused by the allocator's freelist.
        list.insert(4);
        assert_eq!(list.len(), 3);
        assert!(list.contains(4));
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut list = Skiplist::new();
        list.insert(42);
        list.insert(42);
        assert_eq!(list.len(), 1);
    }
}
