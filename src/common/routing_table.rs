//! Kademlia routing table with bucket splitting.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::common::{Id, KBucket, Node, NodeHeap};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// Buckets whose depth is a multiple of this are not split when full,
/// unless they cover our own Id, which bounds the size of the table.
pub const SPLIT_DEPTH_MODULUS: usize = 5;

/// Buckets without a lookup for this long are refreshed.
pub const LONELY_BUCKET_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
/// Kademlia routing table.
///
/// An ordered list of [KBucket]s whose ranges partition the whole Id space
/// in ascending order.
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for a node with the given id.
    pub fn new(id: Id, k: usize) -> Self {
        let k = k.max(1);

        RoutingTable {
            id,
            k,
            buckets: vec![KBucket::new(Id::MIN, Id::MAX, k)],
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    // === Public Methods ===

    /// Empty the table, leaving a single bucket covering the whole Id space.
    pub fn flush(&mut self) {
        self.buckets = vec![KBucket::new(Id::MIN, Id::MAX, self.k)];
    }

    /// Add a node, splitting buckets as needed.
    ///
    /// Returns the least recently seen node of the full bucket if `node` didn't
    /// fit, so the caller can check that it is still alive.
    pub fn add_contact(&mut self, node: Node) -> Option<Node> {
        if node.id == self.id {
            return None;
        }

        loop {
            let index = self.bucket_index(&node.id);
            let bucket = &mut self.buckets[index];

            if bucket.add(node.clone()) {
                return None;
            }

            if bucket.has_in_range(&self.id) || bucket.depth() % SPLIT_DEPTH_MODULUS != 0 {
                self.split_bucket(index);
                continue;
            }

            return bucket.head().cloned();
        }
    }

    /// Remove a node from this routing table.
    pub fn remove_contact(&mut self, node_id: &Id) {
        let index = self.bucket_index(node_id);
        self.buckets[index].remove(node_id);
    }

    /// Returns true if the node is not in its bucket.
    pub fn is_new_node(&self, node_id: &Id) -> bool {
        !self.contains(node_id)
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        self.buckets[self.bucket_index(node_id)].contains(node_id)
    }

    /// Buckets that haven't been looked up in over an hour.
    pub fn lonely_buckets(&self) -> Vec<&KBucket> {
        self.lonely_buckets_at(Instant::now())
    }

    /// A random Id within each lonely bucket, to look up and refresh it.
    pub fn refresh_ids(&self) -> Vec<Id> {
        self.lonely_buckets()
            .iter()
            .map(|bucket| {
                let (lower, upper) = bucket.range();
                Id::random_in_range(&lower, &upper)
            })
            .collect()
    }

    /// Up to `k` nodes nearest to `target`, nearest first.
    ///
    /// Buckets are visited starting from the one covering `target`, then
    /// alternating outward, until `k` nodes are collected. Nodes with the
    /// `target` Id or living at the `exclude` address are skipped.
    pub fn find_neighbors(
        &mut self,
        target: &Id,
        k: Option<usize>,
        exclude: Option<&SocketAddr>,
    ) -> Vec<Node> {
        let k = k.unwrap_or(self.k);
        let index = self.bucket_index(target);
        self.buckets[index].touch_last_updated();

        let mut nearest = NodeHeap::new(*target, k);

        for neighbor in TableTraverser::new(&self.buckets, index) {
            let excluded = exclude.is_some_and(|address| neighbor.same_home_as(address));

            if neighbor.id != *target && !excluded {
                nearest.push(neighbor.clone());
            }

            if nearest.total() == k {
                break;
            }
        }

        trace!(?target, found = nearest.len(), "Found neighbors");

        nearest.into_nodes()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// Returns an iterator over the nodes in this routing table.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|bucket| bucket.nodes())
    }

    // === Private Methods ===

    /// Index of the bucket covering `id`.
    fn bucket_index(&self, id: &Id) -> usize {
        self.buckets
            .iter()
            .position(|bucket| *id <= bucket.range().1)
            .unwrap_or(self.buckets.len() - 1)
    }

    fn split_bucket(&mut self, index: usize) {
        let bucket = self.buckets.remove(index);
        let (one, two) = bucket.split();

        trace!(range = ?one.range(), "Split bucket");

        self.buckets.insert(index, two);
        self.buckets.insert(index, one);
    }

    fn lonely_buckets_at(&self, now: Instant) -> Vec<&KBucket> {
        self.buckets
            .iter()
            .filter(|bucket| now.duration_since(bucket.last_updated()) > LONELY_BUCKET_AGE)
            .collect()
    }
}

/// Iterates nodes bucket by bucket: first the starting bucket,
/// then alternating between its left and right neighbors.
struct TableTraverser<'a> {
    buckets: &'a [KBucket],
    current: Vec<&'a Node>,
    /// Buckets `[0, left)` are yet to be visited.
    left: usize,
    /// Buckets `[right, len)` are yet to be visited.
    right: usize,
    go_left: bool,
}

impl<'a> TableTraverser<'a> {
    fn new(buckets: &'a [KBucket], start: usize) -> Self {
        Self {
            buckets,
            current: buckets[start].nodes().iter().collect(),
            left: start,
            right: start + 1,
            go_left: true,
        }
    }
}

impl<'a> Iterator for TableTraverser<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.current.pop() {
                return Some(node);
            }

            if self.go_left && self.left > 0 {
                self.left -= 1;
                self.current = self.buckets[self.left].nodes().iter().collect();
                self.go_left = false;
                continue;
            }

            if self.right < self.buckets.len() {
                self.current = self.buckets[self.right].nodes().iter().collect();
                self.right += 1;
                self.go_left = true;
                continue;
            }

            if self.left > 0 {
                self.go_left = true;
                continue;
            }

            return None;
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);
        assert!(table.is_empty());

        table.add_contact(Node::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn contains_and_remove() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);

        let node = Node::random();

        assert!(table.is_new_node(&node.id));

        table.add_contact(node.clone());
        assert!(table.contains(&node.id));

        table.remove_contact(&node.id);
        assert!(!table.contains(&node.id));
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);

        let node1 = Node::random();
        let node2 = Node::new(node1.id, SocketAddr::from(([10, 0, 0, 1], 1)));

        table.add_contact(node1);
        table.add_contact(node2);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);
        let node = Node::with_id(*table.id());

        assert!(table.add_contact(node).is_none());
        assert!(table.is_empty())
    }

    #[test]
    fn ranges_partition_the_id_space() {
        let mut table = RoutingTable::new(Id::random(), 4);

        for _ in 0..500 {
            table.add_contact(Node::random());
        }

        let buckets = table.buckets();
        assert!(buckets.len() > 1);

        assert_eq!(buckets[0].range().0, Id::MIN);
        assert_eq!(buckets[buckets.len() - 1].range().1, Id::MAX);

        for pair in buckets.windows(2) {
            assert!(pair[0].range().0 <= pair[0].range().1);
            assert_eq!(pair[0].range().1.successor(), pair[1].range().0);
        }
    }

    #[test]
    fn bucket_capacity_invariant() {
        let k = 3;
        let mut table = RoutingTable::new(Id::random(), k);

        let nodes = (0..1000).map(|_| Node::random()).collect::<Vec<_>>();

        for node in &nodes {
            table.add_contact(node.clone());
        }

        for bucket in table.buckets() {
            assert!(bucket.len() <= k);

            for node in bucket.nodes() {
                assert!(bucket.has_in_range(&node.id));
            }
        }
    }

    #[test]
    fn full_far_bucket_asks_for_ping() {
        let mut own = [0_u8; 20];
        own[0] = 0b1000_0000;
        let mut table = RoutingTable::new(Id(own), 2);

        let node = |first: u8| {
            let mut bytes = [0_u8; 20];
            bytes[0] = first;
            Node::with_id(Id(bytes))
        };

        // Sharing exactly 5 leading bits.
        let a = node(0b0000_0000);
        let b = node(0b0000_0100);

        assert!(table.add_contact(a.clone()).is_none());
        assert!(table.add_contact(b.clone()).is_none());

        // The full range bucket covers our own Id, so it splits, leaving
        // [a, b] in the lower half with a depth of 5, which doesn't split.
        let probe = table.add_contact(node(0b0000_0010));

        assert_eq!(probe, Some(a));
        assert_eq!(table.buckets().len(), 2);
        assert_eq!(table.size(), 2);
        assert_eq!(table.buckets()[0].replacements().count(), 1);
    }

    #[test]
    fn find_neighbors_returns_nearest_known() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);

        let nodes = (0..10).map(|_| Node::random()).collect::<Vec<_>>();
        for node in &nodes {
            table.add_contact(node.clone());
        }

        let target = Id::random();
        let found = table.find_neighbors(&target, Some(5), None);

        let mut expected = nodes.clone();
        expected.sort_by_key(|n| n.distance_to(&target));
        expected.truncate(5);

        assert_eq!(found, expected);
    }

    #[test]
    fn find_neighbors_excludes() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);

        let a = Node::random();
        let b = Node::random();

        table.add_contact(a.clone());
        table.add_contact(b.clone());

        let found = table.find_neighbors(&a.id, None, None);
        assert_eq!(found, vec![b.clone()]);

        let found = table.find_neighbors(&Id::random(), None, Some(&b.address));
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn traverser_visits_every_bucket_once() {
        let mut table = RoutingTable::new(Id::random(), 2);

        for _ in 0..200 {
            table.add_contact(Node::random());
        }

        let size = table.size();

        for start in 0..table.buckets().len() {
            let visited = TableTraverser::new(table.buckets(), start).count();
            assert_eq!(visited, size);
        }
    }

    #[test]
    fn lonely_buckets() {
        let mut table = RoutingTable::new(Id::random(), MAX_BUCKET_SIZE_K);
        table.add_contact(Node::random());

        assert!(table.lonely_buckets().is_empty());

        let later = Instant::now() + LONELY_BUCKET_AGE + Duration::from_secs(1);
        assert_eq!(table.lonely_buckets_at(later).len(), table.buckets().len());

        let ids = table.refresh_ids();
        assert!(ids.is_empty());
    }
}
