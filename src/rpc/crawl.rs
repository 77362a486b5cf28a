//! Iterative lookup of the nodes nearest to a target, or of a stored value.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::common::{Id, Node, NodeHeap, Response, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlKind {
    /// `find_node` until the nearest nodes are all contacted.
    Node,
    /// `find_value` until some node returns the value.
    Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrawlResult {
    /// The nearest nodes to the target, nearest first.
    Nodes(Vec<Node>),
    /// The value the majority of the responding nodes returned, and the
    /// nearest node that didn't have it, to store it there.
    Value { value: Value, repair: Option<Node> },
    /// Every node was contacted and none had the value.
    NotFound,
}

#[derive(Debug)]
/// Spider crawl state machine.
///
/// Each round queries up to `alpha` uncontacted nodes among the `k` nearest,
/// or all of them if the previous round didn't change the nearest set, then
/// waits for every response or timeout before moving on.
pub struct SpiderCrawl {
    kind: CrawlKind,
    alpha: usize,
    nearest: NodeHeap,
    last_ids_crawled: Option<Vec<Id>>,
    /// Peers queried in the current round, in order.
    round: Vec<Id>,
    /// Responses of the current round, `None` for failures.
    responses: HashMap<Id, Option<Response>>,
    nearest_without_value: NodeHeap,
}

impl SpiderCrawl {
    pub fn new(kind: CrawlKind, target: Id, peers: Vec<Node>, k: usize, alpha: usize) -> Self {
        let mut nearest = NodeHeap::new(target, k);
        nearest.push_all(peers);

        debug!(?target, ?kind, seeds = nearest.len(), "Creating spider crawl");

        Self {
            kind,
            alpha: alpha.max(1),
            nearest,
            last_ids_crawled: None,
            round: vec![],
            responses: HashMap::new(),
            nearest_without_value: NodeHeap::new(target, 1),
        }
    }

    // === Getters ===

    pub fn kind(&self) -> CrawlKind {
        self.kind
    }

    pub fn target(&self) -> &Id {
        self.nearest.target()
    }

    /// Returns true if every peer of the current round responded or failed.
    pub fn is_round_done(&self) -> bool {
        self.responses.len() >= self.round.len()
    }

    // === Public Methods ===

    /// Start a new round, returning the peers to query.
    ///
    /// Peers are marked as contacted right away, so a slow peer isn't
    /// queried again. An empty round means every nearest node was contacted.
    pub fn next_round(&mut self) -> Vec<Node> {
        let ids = self.nearest.get_ids();

        let count = if self.last_ids_crawled.as_ref() == Some(&ids) {
            self.nearest.len()
        } else {
            self.alpha
        };

        self.last_ids_crawled = Some(ids);

        let peers = self
            .nearest
            .get_uncontacted()
            .into_iter()
            .take(count)
            .collect::<Vec<_>>();

        for peer in &peers {
            self.nearest.mark_contacted(&peer.id);
        }

        self.round = peers.iter().map(|peer| peer.id).collect();
        self.responses.clear();

        peers
    }

    /// Record a peer's response, or its failure with `None`.
    pub fn handle_response(&mut self, peer: &Id, response: Option<Response>) {
        if self.round.contains(peer) {
            self.responses.insert(*peer, response);
        }
    }

    /// Process the responses of the finished round.
    ///
    /// Returns `None` if another round is needed.
    pub fn finish_round(&mut self) -> Option<CrawlResult> {
        let mut failed = vec![];
        let mut found_values = vec![];

        for peer in std::mem::take(&mut self.round) {
            match self.responses.remove(&peer) {
                Some(Some(Response::Value(value))) if self.kind == CrawlKind::Value => {
                    found_values.push(value);
                }
                Some(Some(Response::Nodes(nodes))) => {
                    if self.kind == CrawlKind::Value {
                        if let Some(node) = self.nearest.get_node(&peer).cloned() {
                            self.nearest_without_value.push(node);
                        }
                    }

                    self.nearest.push_all(nodes);
                }
                Some(Some(_)) => {}
                Some(None) | None => failed.push(peer),
            }
        }

        self.responses.clear();
        self.nearest.remove(&failed);

        if !found_values.is_empty() {
            return Some(self.handle_found_values(found_values));
        }

        if self.nearest.have_contacted_all() {
            return Some(match self.kind {
                CrawlKind::Node => CrawlResult::Nodes(self.nearest.nodes().to_vec()),
                CrawlKind::Value => CrawlResult::NotFound,
            });
        }

        None
    }

    // === Private Methods ===

    fn handle_found_values(&mut self, values: Vec<Value>) -> CrawlResult {
        let mut counts: Vec<(Value, usize)> = vec![];

        for value in values {
            match counts.iter_mut().find(|(v, _)| *v == value) {
                Some((_, count)) => *count += 1,
                None => counts.push((value, 1)),
            }
        }

        if counts.len() != 1 {
            warn!(target = ?self.target(), values = counts.len(), "Got multiple values for key");
        }

        let mut winner = 0;
        for (i, (_, count)) in counts.iter().enumerate() {
            if *count > counts[winner].1 {
                winner = i;
            }
        }

        let value = counts.swap_remove(winner).0;

        CrawlResult::Value {
            value,
            repair: self.nearest_without_value.pop_nearest(),
        }
    }
}
