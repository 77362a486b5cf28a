//! K-bucket: the known nodes of one region of the Id space.

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;

use crate::common::{Id, Node};

/// Size of a bucket's replacement cache, as a multiple of its capacity.
pub const REPLACEMENT_FACTOR: usize = 5;

/// Kbuckets hold up to `k` nodes whose Ids fall within `[lower, upper]`,
/// and remember overflowing nodes in a bounded replacement cache.
#[derive(Debug)]
pub struct KBucket {
    lower: Id,
    upper: Id,
    k: usize,
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
    /// Nodes that didn't fit, evicting the oldest beyond `k * REPLACEMENT_FACTOR`.
    replacements: LruCache<Id, Node>,
    last_updated: Instant,
}

impl KBucket {
    pub fn new(lower: Id, upper: Id, k: usize) -> Self {
        let capacity = NonZeroUsize::new(k * REPLACEMENT_FACTOR).unwrap_or(NonZeroUsize::MIN);

        KBucket {
            lower,
            upper,
            k,
            nodes: Vec::with_capacity(k),
            replacements: LruCache::new(capacity),
            last_updated: Instant::now(),
        }
    }

    // === Getters ===

    /// Inclusive range of Ids this bucket covers.
    pub fn range(&self) -> (Id, Id) {
        (self.lower, self.upper)
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    /// Nodes sorted by the least recently seen.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Replacement nodes, most recently seen first.
    pub fn replacements(&self) -> impl Iterator<Item = &Node> {
        self.replacements.iter().map(|(_, node)| node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    pub fn touch_last_updated(&mut self) {
        self.last_updated = Instant::now();
    }

    /// Add a node to the bucket, returns `false` if the bucket is full.
    ///
    /// A known node moves to the most recently seen position. A node that
    /// doesn't fit goes to the replacement cache instead.
    pub fn add(&mut self, incoming: Node) -> bool {
        if let Some(index) = self.nodes.iter().position(|n| n.id == incoming.id) {
            self.nodes.remove(index);
            self.nodes.push(incoming);

            true
        } else if self.nodes.len() < self.k {
            self.nodes.push(incoming);
            true
        } else {
            self.replacements.put(incoming.id, incoming);
            false
        }
    }

    /// Remove a node, promoting the most recently seen replacement into its place.
    pub fn remove(&mut self, node_id: &Id) {
        self.replacements.pop(node_id);

        if let Some(index) = self.nodes.iter().position(|n| n.id == *node_id) {
            self.nodes.remove(index);

            let newest = self.replacements.iter().next().map(|(id, _)| *id);

            if let Some(replacement) = newest.and_then(|id| self.replacements.pop(&id)) {
                self.nodes.push(replacement);
            }
        }
    }

    /// Split this bucket's range at its midpoint into two buckets,
    /// redistributing nodes and replacements between them.
    pub fn split(self) -> (KBucket, KBucket) {
        let midpoint = self.lower.midpoint(&self.upper);

        let mut one = KBucket::new(self.lower, midpoint, self.k);
        let mut two = KBucket::new(midpoint.successor(), self.upper, self.k);

        let replacements = self
            .replacements
            .iter()
            .rev()
            .map(|(_, node)| node.clone())
            .collect::<Vec<_>>();

        for node in self.nodes.into_iter().chain(replacements) {
            if node.id <= midpoint {
                one.add(node);
            } else {
                two.add(node);
            }
        }

        (one, two)
    }

    pub fn has_in_range(&self, id: &Id) -> bool {
        self.lower <= *id && *id <= self.upper
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.nodes.iter().any(|node| node.id == *id)
    }

    /// Length of the Id prefix all nodes in this bucket share.
    pub fn depth(&self) -> usize {
        let Some(first) = self.nodes.first() else {
            return 0;
        };

        self.nodes
            .iter()
            .map(|node| first.id.shared_prefix_len(&node.id))
            .min()
            .unwrap_or(0)
    }

    /// The least recently seen node.
    pub fn head(&self) -> Option<&Node> {
        self.nodes.first()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn full_range(k: usize) -> KBucket {
        KBucket::new(Id::MIN, Id::MAX, k)
    }

    #[test]
    fn should_not_add_more_than_k() {
        let mut bucket = full_range(3);

        for i in 0..3 {
            assert!(bucket.add(Node::random()), "Failed to add node {i}");
        }

        assert!(!bucket.add(Node::random()));
        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket.replacements().count(), 1);
    }

    #[test]
    fn should_update_existing_node() {
        let mut bucket = full_range(3);

        let node1 = Node::random();
        bucket.add(node1.clone());
        bucket.add(Node::random());

        assert_ne!(bucket.nodes()[1].id, node1.id);

        assert!(bucket.add(node1.clone()));

        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.nodes()[1].id, node1.id);
        assert_eq!(bucket.head().map(|n| n.id), Some(bucket.nodes()[0].id));
    }

    #[test]
    fn replacement_cache_is_bounded() {
        let k = 2;
        let mut bucket = full_range(k);

        bucket.add(Node::random());
        bucket.add(Node::random());

        let overflow = (0..k * REPLACEMENT_FACTOR + 3)
            .map(|_| Node::random())
            .collect::<Vec<_>>();

        for node in &overflow {
            assert!(!bucket.add(node.clone()));
        }

        let cached = bucket.replacements().map(|n| n.id).collect::<Vec<_>>();

        assert_eq!(cached.len(), k * REPLACEMENT_FACTOR);
        // Oldest are evicted first, newest come first.
        assert_eq!(cached[0], overflow[overflow.len() - 1].id);
        assert!(!cached.contains(&overflow[0].id));
    }

    #[test]
    fn remove_promotes_newest_replacement() {
        let mut bucket = full_range(1);

        let node = Node::random();
        let older = Node::random();
        let newer = Node::random();

        bucket.add(node.clone());
        bucket.add(older.clone());
        bucket.add(newer.clone());

        bucket.remove(&node.id);

        assert_eq!(bucket.nodes(), &[newer]);
        assert_eq!(bucket.replacements().next(), Some(&older));
    }

    #[test]
    fn split_partitions_range_and_nodes() {
        let mut bucket = full_range(20);

        let nodes = (0..30).map(|_| Node::random()).collect::<Vec<_>>();
        for node in &nodes {
            bucket.add(node.clone());
        }

        let (lower, upper) = bucket.range();
        let (one, two) = bucket.split();

        let midpoint = lower.midpoint(&upper);

        assert_eq!(one.range(), (lower, midpoint));
        assert_eq!(two.range(), (midpoint.successor(), upper));

        let mut seen = one
            .nodes()
            .iter()
            .chain(one.replacements())
            .chain(two.nodes())
            .chain(two.replacements())
            .map(|n| n.id)
            .collect::<Vec<_>>();

        for node in one.nodes().iter().chain(one.replacements()) {
            assert!(one.has_in_range(&node.id));
        }
        for node in two.nodes().iter().chain(two.replacements()) {
            assert!(two.has_in_range(&node.id));
        }

        seen.sort();
        let mut expected = nodes.iter().map(|n| n.id).collect::<Vec<_>>();
        expected.sort();

        assert_eq!(seen, expected);
    }

    #[test]
    fn depth() {
        let mut bucket = full_range(3);
        assert_eq!(bucket.depth(), 0);

        let mut a = [0_u8; 20];
        a[0] = 0b1010_0000;
        let mut b = a;
        b[0] = 0b1011_0000;

        bucket.add(Node::with_id(Id(a)));
        bucket.add(Node::with_id(Id(b)));

        assert_eq!(bucket.depth(), 3);
    }
}
