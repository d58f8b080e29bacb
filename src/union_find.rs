//! Disjoint-set forest over dense integer ids
use serde::{Deserialize, Serialize};

/// Metadata kept at every set root and folded together when two sets join
pub(crate) trait Merge {
    /// Folds the losing root's metadata into the winning root's
    fn merge(&mut self, loser: &Self);
}

impl Merge for () {
    fn merge(&mut self, _: &Self) {}
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
struct Node<M> {
    /// Parent id, or `-1` at a root
    parent: i32,
    /// Number of elements in the set; valid only at roots
    size: u32,
    meta: M,
}

/// Union-find forest with union-by-size and path compression
///
/// Ids are dense `i32` indices in creation order. Size ties are broken
/// toward the lower id, so the forest shape is a pure function of the union
/// sequence regardless of argument order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Forest<M> {
    nodes: Vec<Node<M>>,
}

impl<M: Merge> Forest<M> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Number of sets ever created (merged sets are still counted)
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Creates a fresh singleton set and returns its id
    ///
    /// The caller is responsible for keeping the forest below `i32::MAX`
    /// entries.
    pub fn make_set(&mut self, meta: M) -> i32 {
        debug_assert!(self.nodes.len() < i32::MAX as usize);
        let id = self.nodes.len() as i32;
        self.nodes.push(Node {
            parent: -1,
            size: 1,
            meta,
        });
        id
    }

    /// Discards all sets and re-creates `n` singletons with default metadata
    pub fn reset(&mut self, n: usize)
    where
        M: Default,
    {
        self.nodes.clear();
        self.nodes.resize_with(n, || Node {
            parent: -1,
            size: 1,
            meta: M::default(),
        });
    }

    pub fn is_root(&self, id: i32) -> bool {
        self.nodes[id as usize].parent < 0
    }

    /// Number of elements in the set rooted at `id`
    pub fn size(&self, id: i32) -> u32 {
        debug_assert!(self.is_root(id));
        self.nodes[id as usize].size
    }

    pub fn meta(&self, id: i32) -> &M {
        &self.nodes[id as usize].meta
    }

    pub fn meta_mut(&mut self, id: i32) -> &mut M {
        &mut self.nodes[id as usize].meta
    }

    /// Finds the canonical representative, compressing the path behind it
    pub fn find(&mut self, id: i32) -> i32 {
        let mut root = id;
        while self.nodes[root as usize].parent >= 0 {
            root = self.nodes[root as usize].parent;
        }
        let mut cur = id;
        while cur != root {
            let next = self.nodes[cur as usize].parent;
            self.nodes[cur as usize].parent = root;
            cur = next;
        }
        root
    }

    /// Joins the sets holding `a` and `b` and returns the surviving root
    ///
    /// On a true merge the loser's size and metadata are folded into the
    /// winner; if `a` and `b` already share a root this is a no-op.
    pub fn union(&mut self, a: i32, b: i32) -> i32 {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        let sa = self.nodes[ra as usize].size;
        let sb = self.nodes[rb as usize].size;
        let (win, lose) = if sa > sb || (sa == sb && ra < rb) {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.nodes[lose as usize].parent = win;
        let (w, l) = index_pair(&mut self.nodes, win as usize, lose as usize);
        w.size += l.size;
        w.meta.merge(&l.meta);
        win
    }
}

/// Mutable references to two distinct slice elements
fn index_pair<T>(slice: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    debug_assert!(a != b);
    if a < b {
        let (lo, hi) = slice.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = slice.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}
