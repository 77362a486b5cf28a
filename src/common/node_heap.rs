//! Nodes sorted by distance to a target.

use std::collections::HashSet;

use crate::common::{Id, Node};

#[derive(Debug, Clone)]
/// Nodes sorted by their distance to a target, nearest first.
///
/// Any number of nodes can be pushed, but only the `maxsize` nearest
/// are visible through [NodeHeap::nodes] and friends.
pub struct NodeHeap {
    target: Id,
    maxsize: usize,
    nodes: Vec<Node>,
    contacted: HashSet<Id>,
}

impl NodeHeap {
    pub fn new(target: Id, maxsize: usize) -> Self {
        Self {
            target,
            maxsize,
            nodes: Vec::with_capacity(maxsize),
            contacted: HashSet::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    /// The `maxsize` nearest nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes[..self.len()]
    }

    /// Number of visible nodes, at most `maxsize`.
    pub fn len(&self) -> usize {
        self.nodes.len().min(self.maxsize)
    }

    /// Number of nodes pushed and not removed, visible or not.
    pub fn total(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Public Methods ===

    /// Insert a node in order of distance, ignoring already known Ids.
    pub fn push(&mut self, node: Node) {
        let seek = node.id.xor(&self.target);

        if self.nodes.iter().any(|n| n.id == node.id) {
            return;
        }

        let position = self
            .nodes
            .partition_point(|probe| probe.id.xor(&self.target) < seek);

        self.nodes.insert(position, node);
    }

    pub fn push_all<I: IntoIterator<Item = Node>>(&mut self, nodes: I) {
        for node in nodes {
            self.push(node);
        }
    }

    /// Remove nodes by Id, letting farther nodes move into view.
    pub fn remove(&mut self, ids: &[Id]) {
        self.nodes.retain(|node| !ids.contains(&node.id));
    }

    pub fn get_node(&self, id: &Id) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == *id)
    }

    /// Ids of the visible nodes, nearest first.
    pub fn get_ids(&self) -> Vec<Id> {
        self.nodes().iter().map(|node| node.id).collect()
    }

    pub fn mark_contacted(&mut self, id: &Id) {
        self.contacted.insert(*id);
    }

    /// Visible nodes we haven't contacted yet.
    pub fn get_uncontacted(&self) -> Vec<Node> {
        self.nodes()
            .iter()
            .filter(|node| !self.contacted.contains(&node.id))
            .cloned()
            .collect()
    }

    /// Returns true if every visible node has been contacted.
    pub fn have_contacted_all(&self) -> bool {
        self.nodes()
            .iter()
            .all(|node| self.contacted.contains(&node.id))
    }

    /// Take the nearest node out of the heap.
    pub fn pop_nearest(&mut self) -> Option<Node> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(self.nodes.remove(0))
        }
    }

    /// The visible nodes, nearest first.
    pub fn into_nodes(mut self) -> Vec<Node> {
        self.nodes.truncate(self.maxsize);
        self.nodes
    }
}
