//! NUMA node identifiers and node masks
//!
//! A [`NodeMask`] is the bitmap representation of a set of NUMA nodes that the
//! operating system expects when binding memory: bit `i` is set if and only
//! if NUMA node `i` belongs to the set.

use derive_more::{Display, From, Into};
use std::{
    ffi::c_ulong,
    fmt::{self, Formatter},
};

/// OS index of a NUMA node
///
/// This is the number under which the operating system knows the node, e.g.
/// `3` for `/sys/devices/system/node/node3` on Linux.
#[derive(
    Copy, Clone, Debug, Default, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd,
)]
pub struct NodeId(u32);
//
impl NodeId {
    /// Node with the given OS index
    pub const fn new(os_index: u32) -> Self {
        Self(os_index)
    }

    /// OS index of this node
    pub const fn os_index(self) -> u32 {
        self.0
    }

    /// Bit position of this node in a [`NodeMask`]
    pub(crate) fn bit(self) -> usize {
        usize::try_from(self.0).expect("u32 should fit in usize")
    }

    /// Node at a given bit position of a [`NodeMask`]
    fn from_bit(bit: usize) -> Self {
        Self(u32::try_from(bit).expect("node masks are bounded by MAX_NODE"))
    }
}

/// Number of bits in a word of a [`NodeMask`]
const WORD_BITS: usize = c_ulong::BITS as usize;

/// Set of NUMA nodes in the bitmap layout expected by the OS
///
/// The words are stored least significant first, which is the layout of the
/// `unsigned long` array that Linux's `mbind()` and `set_mempolicy()` consume.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct NodeMask {
    /// Bitmap words, without trailing zero words
    words: Vec<c_ulong>,
}
//
impl NodeMask {
    /// Highest NUMA node OS index that a node mask can hold
    ///
    /// This matches the largest node count supported by Linux kernels
    /// (`CONFIG_NODES_SHIFT=10`).
    pub const MAX_NODE: NodeId = NodeId(1023);

    /// Empty node mask
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Node mask containing the given nodes
    ///
    /// # Panics
    ///
    /// If one of the nodes is above [`NodeMask::MAX_NODE`]
    pub fn from_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut mask = Self::new();
        for node in nodes {
            mask.set(node);
        }
        mask
    }

    /// Add a node to the mask
    ///
    /// # Panics
    ///
    /// If `node` is above [`NodeMask::MAX_NODE`]
    pub fn set(&mut self, node: NodeId) {
        assert!(
            node <= Self::MAX_NODE,
            "NUMA node {node} cannot be stored in a node mask"
        );
        let (word, bit) = (node.bit() / WORD_BITS, node.bit() % WORD_BITS);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    /// Truth that `node` belongs to the mask
    pub fn is_set(&self, node: NodeId) -> bool {
        let (word, bit) = (node.bit() / WORD_BITS, node.bit() % WORD_BITS);
        self.words
            .get(word)
            .is_some_and(|&word| word & (1 << bit) != 0)
    }

    /// Truth that the mask contains no node
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of nodes in the mask
    pub fn weight(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    /// Highest node of the mask, if any
    pub fn last_set(&self) -> Option<NodeId> {
        let (idx, word) = self.words.iter().enumerate().next_back()?;
        let bit = WORD_BITS - 1 - word.leading_zeros() as usize;
        Some(NodeId::from_bit(idx * WORD_BITS + bit))
    }

    /// Highest set bit of the mask, or 0 for an empty mask
    ///
    /// This is the `maxnode` parameter that accompanies a node mask in the OS
    /// memory provider parameters. Note that an empty mask and the mask `{0}`
    /// share the same `maxnode`, so emptiness must be checked separately.
    pub fn maxnode(&self) -> usize {
        self.last_set().map_or(0, NodeId::bit)
    }

    /// Nodes of the mask, in increasing order
    pub fn iter_set(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| NodeId::from_bit(idx * WORD_BITS + bit))
        })
    }

    /// Raw bitmap words, least significant first
    pub fn as_words(&self) -> &[c_ulong] {
        &self.words
    }
}
//
impl fmt::Display for NodeMask {
    /// Display the mask in the Linux list format, e.g. `0-2,5`
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut nodes = self.iter_set().peekable();
        let mut first = true;
        while let Some(start) = nodes.next() {
            let mut end = start;
            while let Some(&next) = nodes.peek() {
                if next.0 != end.0 + 1 {
                    break;
                }
                end = next;
                nodes.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}
//
impl FromIterator<NodeId> for NodeMask {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self::from_nodes(iter)
    }
}

#[cfg(any(test, feature = "proptest"))]
impl proptest::arbitrary::Arbitrary for NodeId {
    type Parameters = ();
    type Strategy = proptest::strategy::Map<std::ops::Range<u32>, fn(u32) -> Self>;

    fn arbitrary_with((): ()) -> Self::Strategy {
        use proptest::strategy::Strategy;
        // Real machines have few NUMA nodes, so keep ids small enough that
        // node sets collide and span several mask words
        (0..(2 * WORD_BITS as u32 + 8)).prop_map(NodeId as fn(u32) -> Self)
    }
}
