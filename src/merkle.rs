//! Interval-partitioned Merkle tree.
//!
//! Summarises the items of a ring interval into a balanced hash tree so two
//! nodes can locate differing sub-intervals without exchanging all keys.
//! Leaves hold buckets of `(key, item hash)` pairs and split into
//! `branch_factor` equi-partitioned children when they outgrow `bucket_size`.
//! Hashes are computed once at finalisation; a finalised tree is frozen.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::interval::Interval;
use crate::keys::RingKey;

/// Hash of a tree node or of a summarised item.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHash(pub [u8; 32]);

impl NodeHash {
    /// The hash of a leaf with no items (and the XOR identity).
    pub const EMPTY: NodeHash = NodeHash([0u8; 32]);

    /// Hash arbitrary bytes into a `NodeHash`.
    pub fn of(bytes: impl AsRef<[u8]>) -> NodeHash {
        NodeHash(blake3::hash(bytes.as_ref()).into())
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…)")
    }
}

impl AsRef<[u8]> for NodeHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::ops::BitXorAssign for NodeHash {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

/// Hash function over a leaf bucket.
pub type LeafHasher = fn(&[(RingKey, NodeHash)]) -> NodeHash;

/// Hash function combining child hashes into an inner node hash.
pub type InnerHasher = fn(&[NodeHash]) -> NodeHash;

/// Default leaf hash: blake3 over the key-sorted bucket, domain-separated.
pub fn leaf_hash(entries: &[(RingKey, NodeHash)]) -> NodeHash {
    if entries.is_empty() {
        return NodeHash::EMPTY;
    }
    let mut sorted: Vec<&(RingKey, NodeHash)> = entries.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"leaf");
    for (key, item) in sorted {
        hasher.update(&key.value().to_be_bytes());
        hasher.update(&item.0);
    }
    NodeHash(hasher.finalize().into())
}

/// Default inner hash: bitwise XOR of the child hashes. Commutative, which is
/// sound only because child intervals are disjoint.
pub fn inner_hash(children: &[NodeHash]) -> NodeHash {
    let mut acc = NodeHash::EMPTY;
    for child in children {
        acc ^= *child;
    }
    acc
}

/// Tree shape and hash configuration.
#[derive(Clone, Copy)]
pub struct MerkleConfig {
    /// Children per split leaf. At least 2.
    pub branch_factor: usize,
    /// Items a leaf holds before it splits.
    pub bucket_size: usize,
    /// Leaf bucket hash.
    pub leaf_hash: LeafHasher,
    /// Inner node hash.
    pub inner_hash: InnerHasher,
}

impl Default for MerkleConfig {
    fn default() -> Self {
        MerkleConfig {
            branch_factor: 2,
            bucket_size: 64,
            leaf_hash,
            inner_hash,
        }
    }
}

impl fmt::Debug for MerkleConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MerkleConfig")
            .field("branch_factor", &self.branch_factor)
            .field("bucket_size", &self.bucket_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("tree interval is empty")]
    EmptyInterval,
    #[error("key outside the tree interval")]
    OutOfInterval,
    #[error("tree already finalised")]
    Finalised,
    #[error("tree not finalised")]
    NotFinalised,
    #[error("trees cover different intervals")]
    IntervalMismatch,
}

/// Wire description of a single tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    /// The interval the node covers.
    pub interval: Interval,
    /// The node hash.
    pub hash: NodeHash,
    /// Whether the node is a leaf.
    pub leaf: bool,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        interval: Interval,
        bucket: Vec<(RingKey, NodeHash)>,
        hash: Option<NodeHash>,
    },
    Inner {
        interval: Interval,
        children: Vec<Node>,
        count: usize,
        hash: Option<NodeHash>,
    },
}

impl Node {
    fn interval(&self) -> &Interval {
        match self {
            Node::Leaf { interval, .. } | Node::Inner { interval, .. } => interval,
        }
    }

    fn hash(&self) -> NodeHash {
        match self {
            Node::Leaf { hash, .. } | Node::Inner { hash, .. } => {
                hash.expect("hash queried before finalise")
            }
        }
    }

    fn count(&self) -> usize {
        match self {
            Node::Leaf { bucket, .. } => bucket.len(),
            Node::Inner { count, .. } => *count,
        }
    }

    fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }
}

/// The tree itself. Build with [`MerkleTree::insert`], freeze with
/// [`MerkleTree::finalise`], then compare or summarise.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    config: MerkleConfig,
    root: Node,
    finalised: bool,
}

impl MerkleTree {
    /// An empty tree over `interval`. Fails if the interval is empty.
    pub fn new(interval: Interval, config: MerkleConfig) -> Result<Self, MerkleError> {
        if interval.is_empty() {
            return Err(MerkleError::EmptyInterval);
        }
        debug_assert!(config.branch_factor >= 2);
        debug_assert!(config.bucket_size >= 1);
        Ok(MerkleTree {
            config,
            root: Node::Leaf {
                interval,
                bucket: Vec::new(),
                hash: None,
            },
            finalised: false,
        })
    }

    /// Insert an item. Replaces the item hash if `key` is already present.
    pub fn insert(&mut self, key: RingKey, item: NodeHash) -> Result<(), MerkleError> {
        if self.finalised {
            return Err(MerkleError::Finalised);
        }
        if !self.root.interval().contains(key) {
            return Err(MerkleError::OutOfInterval);
        }
        insert_node(&mut self.root, key, item, &self.config);
        Ok(())
    }

    /// Compute all hashes bottom-up and freeze the tree.
    pub fn finalise(mut self) -> MerkleTree {
        if !self.finalised {
            finalise_node(&mut self.root, &self.config);
            self.finalised = true;
        }
        self
    }

    /// Whether [`MerkleTree::finalise`] ran.
    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    /// Total number of items.
    pub fn size(&self) -> usize {
        self.root.count()
    }

    /// The interval the tree covers.
    pub fn interval(&self) -> &Interval {
        self.root.interval()
    }

    /// The root hash.
    pub fn root_hash(&self) -> Result<NodeHash, MerkleError> {
        if !self.finalised {
            return Err(MerkleError::NotFinalised);
        }
        Ok(self.root.hash())
    }

    /// Wire summary of the root.
    pub fn root_summary(&self) -> Result<NodeSummary, MerkleError> {
        if !self.finalised {
            return Err(MerkleError::NotFinalised);
        }
        Ok(NodeSummary {
            interval: *self.root.interval(),
            hash: self.root.hash(),
            leaf: self.root.is_leaf(),
        })
    }

    /// The node hashes of every level, root first. Leaves appear at the level
    /// of their own depth only.
    pub fn levels(&self) -> Result<Vec<Vec<NodeSummary>>, MerkleError> {
        if !self.finalised {
            return Err(MerkleError::NotFinalised);
        }
        let mut levels = Vec::new();
        let mut frontier = vec![&self.root];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            let mut level = Vec::new();
            for node in frontier {
                level.push(NodeSummary {
                    interval: *node.interval(),
                    hash: node.hash(),
                    leaf: node.is_leaf(),
                });
                if let Node::Inner { children, .. } = node {
                    next.extend(children.iter().filter(|c| !c.interval().is_empty()));
                }
            }
            levels.push(level);
            frontier = next;
        }
        Ok(levels)
    }

    /// Look up the hash covering exactly `interval`.
    ///
    /// If `interval` falls inside one of our leaves, a synthetic leaf summary
    /// over the bucket subset is returned, so trees of different depths can be
    /// compared node by node. `None` means the interval does not align with
    /// the tree structure at all.
    pub fn summary_at(&self, interval: &Interval) -> Result<Option<NodeSummary>, MerkleError> {
        if !self.finalised {
            return Err(MerkleError::NotFinalised);
        }
        let mut node = &self.root;
        loop {
            if node.interval() == interval {
                return Ok(Some(NodeSummary {
                    interval: *interval,
                    hash: node.hash(),
                    leaf: node.is_leaf(),
                }));
            }
            match node {
                Node::Leaf { bucket, .. } => {
                    if !interval.difference(node.interval()).is_empty() {
                        return Ok(None);
                    }
                    let subset: Vec<(RingKey, NodeHash)> = bucket
                        .iter()
                        .filter(|(k, _)| interval.contains(*k))
                        .copied()
                        .collect();
                    return Ok(Some(NodeSummary {
                        interval: *interval,
                        hash: (self.config.leaf_hash)(&subset),
                        leaf: true,
                    }));
                }
                Node::Inner { children, .. } => {
                    match children
                        .iter()
                        .find(|c| interval.difference(c.interval()).is_empty())
                    {
                        Some(child) => node = child,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Wire summaries of the children of the node covering exactly
    /// `interval`. `None` if that node is a leaf or absent.
    pub fn children_of(&self, interval: &Interval) -> Result<Option<Vec<NodeSummary>>, MerkleError> {
        if !self.finalised {
            return Err(MerkleError::NotFinalised);
        }
        let mut node = &self.root;
        loop {
            if node.interval() == interval {
                return match node {
                    Node::Leaf { .. } => Ok(None),
                    Node::Inner { children, .. } => Ok(Some(
                        children
                            .iter()
                            .filter(|c| !c.interval().is_empty())
                            .map(|c| NodeSummary {
                                interval: *c.interval(),
                                hash: c.hash(),
                                leaf: c.is_leaf(),
                            })
                            .collect(),
                    )),
                };
            }
            match node {
                Node::Leaf { .. } => return Ok(None),
                Node::Inner { children, .. } => {
                    match children
                        .iter()
                        .find(|c| interval.difference(c.interval()).is_empty())
                    {
                        Some(child) => node = child,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Structural comparison of two finalised trees over the same interval:
    /// the minimal set of disjoint sub-intervals whose leaf signatures differ.
    /// Symmetric in its arguments.
    pub fn compare(&self, other: &MerkleTree) -> Result<Vec<Interval>, MerkleError> {
        if !self.finalised || !other.finalised {
            return Err(MerkleError::NotFinalised);
        }
        if self.root.interval() != other.root.interval() {
            return Err(MerkleError::IntervalMismatch);
        }
        let mut out = Vec::new();
        diff_nodes(&self.root, &other.root, &self.config, &mut out);
        Ok(out)
    }
}

fn insert_node(node: &mut Node, key: RingKey, item: NodeHash, config: &MerkleConfig) -> bool {
    match node {
        Node::Leaf {
            interval, bucket, ..
        } => {
            if let Some(slot) = bucket.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = item;
                return false;
            }
            if bucket.len() < config.bucket_size {
                bucket.push((key, item));
                return true;
            }
            // split: equi-partition the leaf and redistribute
            let children: Vec<Node> = interval
                .partition(config.branch_factor)
                .into_iter()
                .map(|iv| Node::Leaf {
                    interval: iv,
                    bucket: Vec::new(),
                    hash: None,
                })
                .collect();
            let interval = *interval;
            let old = std::mem::take(bucket);
            let count = old.len();
            *node = Node::Inner {
                interval,
                children,
                count,
                hash: None,
            };
            if let Node::Inner { children, count, .. } = node {
                for (k, h) in old {
                    let child = children
                        .iter_mut()
                        .find(|c| c.interval().contains(k))
                        .expect("children cover the leaf interval");
                    insert_node(child, k, h, config);
                }
                let child = children
                    .iter_mut()
                    .find(|c| c.interval().contains(key))
                    .expect("children cover the leaf interval");
                let added = insert_node(child, key, item, config);
                *count += added as usize;
                added
            } else {
                unreachable!()
            }
        }
        Node::Inner {
            children, count, ..
        } => {
            let child = children
                .iter_mut()
                .find(|c| c.interval().contains(key))
                .expect("children cover the node interval");
            let added = insert_node(child, key, item, config);
            *count += added as usize;
            added
        }
    }
}

fn finalise_node(node: &mut Node, config: &MerkleConfig) {
    match node {
        Node::Leaf { bucket, hash, .. } => {
            *hash = Some((config.leaf_hash)(bucket));
        }
        Node::Inner {
            children, hash, ..
        } => {
            let mut hashes = Vec::with_capacity(children.len());
            for child in children.iter_mut() {
                finalise_node(child, config);
                hashes.push(child.hash());
            }
            *hash = Some((config.inner_hash)(&hashes));
        }
    }
}

fn diff_nodes(a: &Node, b: &Node, config: &MerkleConfig, out: &mut Vec<Interval>) {
    if a.hash() == b.hash() {
        return;
    }
    match (a, b) {
        (Node::Leaf { .. }, Node::Leaf { .. }) => {
            debug_assert_eq!(a.interval(), b.interval());
            out.push(*a.interval());
        }
        (
            Node::Inner {
                children: left, ..
            },
            Node::Inner {
                children: right, ..
            },
        ) => {
            // partitioning is deterministic, so the children line up
            debug_assert_eq!(left.len(), right.len());
            for (l, r) in left.iter().zip(right) {
                debug_assert_eq!(l.interval(), r.interval());
                diff_nodes(l, r, config, out);
            }
        }
        (Node::Leaf { bucket, .. }, inner) | (inner, Node::Leaf { bucket, .. }) => {
            diff_bucket_vs_node(bucket, inner, config, out);
        }
    }
}

/// Compare a bucket subset of a shallow leaf against a deeper subtree of the
/// other side, descending to that subtree's leaves.
fn diff_bucket_vs_node(
    bucket: &[(RingKey, NodeHash)],
    node: &Node,
    config: &MerkleConfig,
    out: &mut Vec<Interval>,
) {
    let subset: Vec<(RingKey, NodeHash)> = bucket
        .iter()
        .filter(|(k, _)| node.interval().contains(*k))
        .copied()
        .collect();
    if (config.leaf_hash)(&subset) == node.hash() {
        return;
    }
    match node {
        Node::Leaf { .. } => out.push(*node.interval()),
        Node::Inner { children, .. } => {
            for child in children.iter().filter(|c| !c.interval().is_empty()) {
                diff_bucket_vs_node(bucket, child, config, out);
            }
        }
    }
}
