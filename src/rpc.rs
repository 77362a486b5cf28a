//! Kademlia Rpc node: routing table, storage, and lookups driven from a single loop.

mod config;
mod crawl;
mod info;
mod server;
mod socket;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::{debug, info, warn};

use crate::common::{
    Frame, Id, MessageId, Node, Request, RequestSpecific, Response, RoutingTable, Storage,
    Value,
};
use crate::state::State;
use crate::Result;

pub use crate::common::MAX_REQUEST_SIZE;
pub use config::*;
pub use crawl::{CrawlKind, CrawlResult, SpiderCrawl};
pub use info::Info;
pub use socket::{Incoming, InflightRequest, RpcSocket, MAX_THREAD_BLOCK_DURATION};

type OperationId = u64;

#[derive(Debug, Clone, Copy)]
/// What to do with the result of an outgoing call.
enum Purpose {
    /// `find_node` or `find_value` of a lookup.
    Crawl(OperationId),
    /// `ping` of a bootstrapping address.
    BootstrapPing(OperationId),
    /// `store` of a `set` or a republish.
    Store(OperationId),
    /// `ping` of a bucket's least recently seen node.
    Probe,
    /// `store` handing a value over to a new or repaired node.
    Replicate,
}

#[derive(Debug)]
struct PendingCall {
    /// Unknown when pinging a bootstrapping address.
    node_id: Option<Id>,
    purpose: Purpose,
}

#[derive(Debug)]
enum Operation {
    Bootstrap {
        pending: usize,
        found: Vec<Node>,
        reply: Option<Sender<Vec<Node>>>,
    },
    Crawl {
        crawl: SpiderCrawl,
        then: AfterCrawl,
    },
    Store {
        pending: usize,
        stored: bool,
        reply: Option<Sender<Result<bool>>>,
    },
    /// Lonely bucket lookups, then republishing.
    Refresh { pending: usize },
}

#[derive(Debug)]
enum AfterCrawl {
    Bootstrap(Option<Sender<Vec<Node>>>),
    Refresh(OperationId),
    Get {
        key: Id,
        reply: Sender<Option<Value>>,
    },
    Set {
        key: Id,
        value: Value,
        reply: Option<Sender<Result<bool>>>,
    },
}

#[derive(Debug)]
/// A Kademlia node.
///
/// Owns the socket, the routing table, the storage and every
/// ongoing lookup, and advances them all with [Rpc::tick].
pub struct Rpc {
    id: Id,
    k: usize,
    alpha: usize,
    socket: RpcSocket,
    routing_table: RoutingTable,
    storage: Storage,

    calls: HashMap<MessageId, PendingCall>,
    operations: HashMap<OperationId, Operation>,
    next_operation_id: OperationId,

    refresh_interval: Duration,
    last_refresh: Instant,

    state_path: Option<PathBuf>,
    save_state_frequency: Duration,
    last_state_save: Option<Instant>,
}

impl Rpc {
    /// Bind the socket and create an empty node.
    pub fn new(config: &Config) -> Result<Self> {
        let id = config.id.unwrap_or_else(Id::random);
        let socket = RpcSocket::new(config)?;

        info!(?id, local_addr = ?socket.local_addr(), "Listening");

        Ok(Rpc {
            id,
            k: config.k,
            alpha: config.alpha,
            socket,
            routing_table: RoutingTable::new(id, config.k),
            storage: Storage::new(config.storage_ttl),

            calls: HashMap::new(),
            operations: HashMap::new(),
            next_operation_id: 0,

            refresh_interval: config.refresh_interval,
            last_refresh: Instant::now(),

            state_path: config.state_path.clone(),
            save_state_frequency: config.save_state_frequency,
            last_state_save: None,
        })
    }

    /// Replace the storage, to restore a saved state.
    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    // === Getters ===

    /// Returns this node's Id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Number of lookups, bootstraps and store fan-outs in progress.
    pub fn operations_count(&self) -> usize {
        self.operations.len()
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Advance everything by one step: expire calls that timed out, run
    /// periodic maintenance, and handle at most one incoming datagram.
    pub fn tick(&mut self) {
        for request in self.socket.timed_out() {
            debug!(to = ?request.to, method = %request.method, "Call timed out");
            self.handle_call_result(request.message_id, request.to, None);
        }

        if self.last_refresh.elapsed() >= self.refresh_interval {
            self.last_refresh = Instant::now();
            self.refresh_table();
        }

        self.save_state_regularly();

        match self.socket.recv_from() {
            Some(Incoming::Request {
                from,
                message_id,
                request,
            }) => server::handle_request(self, from, message_id, request),
            Some(Incoming::Response {
                from,
                request,
                response,
            }) => self.handle_call_result(request.message_id, from, Some(response)),
            None => {}
        }
    }

    /// Ping every address, then look up our own Id starting from those
    /// that responded, to populate the routing table.
    ///
    /// Replies with the nodes nearest to us found by the lookup, empty if no
    /// address responded.
    pub fn bootstrap(&mut self, addresses: &[String], reply: Option<Sender<Vec<Node>>>) {
        let operation_id = self.next_operation_id();
        let mut pending = 0;

        for address in addresses {
            let Ok(resolved) = address.to_socket_addrs() else {
                warn!(?address, "Could not resolve bootstrapping address");
                continue;
            };

            for address in resolved {
                if self.call(
                    None,
                    address,
                    RequestSpecific::Ping,
                    Purpose::BootstrapPing(operation_id),
                ) {
                    pending += 1;
                }
            }
        }

        if pending == 0 {
            debug!("No bootstrapping nodes to ping");
            self.bootstrap_crawl(vec![], reply);
            return;
        }

        self.operations.insert(
            operation_id,
            Operation::Bootstrap {
                pending,
                found: vec![],
                reply,
            },
        );
    }

    /// Get the value stored under `key`, from local storage if present,
    /// otherwise by a value lookup.
    pub fn get(&mut self, key: Id, reply: Sender<Option<Value>>) {
        if let Some(value) = self.storage.get(&key) {
            let _ = reply.send(Some(value.clone()));
            return;
        }

        let nearest = self.routing_table.find_neighbors(&key, None, None);

        if nearest.is_empty() {
            warn!(?key, "There are no known neighbors to get key");
            let _ = reply.send(None);
            return;
        }

        let crawl = SpiderCrawl::new(CrawlKind::Value, key, nearest, self.k, self.alpha);
        self.start_crawl(crawl, AfterCrawl::Get { key, reply });
    }

    /// Store `value` under `key` on the nodes nearest to it.
    ///
    /// Replies `true` if at least one node stored it, or if we know
    /// no other node and stored it locally. Replies with
    /// [crate::Error::RequestTooLarge], storing nothing, if the value doesn't
    /// fit in a `store` request.
    pub fn set(&mut self, key: Id, value: Value, reply: Option<Sender<Result<bool>>>) {
        if let Err(error) = self.check_store_size(key, &value) {
            warn!(?key, ?error, "Value is too large to store");

            if let Some(reply) = reply {
                let _ = reply.send(Err(error));
            }
            return;
        }

        let nearest = self.routing_table.find_neighbors(&key, None, None);

        if nearest.is_empty() {
            warn!(?key, "There are no known neighbors to set key, storing locally");
            self.storage.set(key, value);

            if let Some(reply) = reply {
                let _ = reply.send(Ok(true));
            }
            return;
        }

        let crawl = SpiderCrawl::new(CrawlKind::Node, key, nearest, self.k, self.alpha);
        self.start_crawl(crawl, AfterCrawl::Set { key, value, reply });
    }

    /// Address of the nodes nearest to us, to bootstrap from after a restart.
    pub fn bootstrappable_neighbors(&mut self) -> Vec<SocketAddr> {
        let id = self.id;

        self.routing_table
            .find_neighbors(&id, None, None)
            .iter()
            .map(|node| node.address)
            .collect()
    }

    /// Snapshot of this node for a warm restart.
    pub fn state(&mut self) -> State {
        State {
            ksize: self.k,
            alpha: self.alpha,
            id: self.id,
            neighbors: self.bootstrappable_neighbors(),
            storage: self.storage.clone(),
        }
    }

    // === Private Methods ===

    fn next_operation_id(&mut self) -> OperationId {
        let id = self.next_operation_id;
        self.next_operation_id = self.next_operation_id.wrapping_add(1);
        id
    }

    /// Send a request, returns false if it couldn't be sent at all.
    fn call(
        &mut self,
        node_id: Option<Id>,
        address: SocketAddr,
        request_type: RequestSpecific,
        purpose: Purpose,
    ) -> bool {
        let request = Request {
            sender_id: self.id,
            request_type,
        };

        match self.socket.request(address, &request) {
            Ok(message_id) => {
                self.calls
                    .insert(message_id, PendingCall { node_id, purpose });
                true
            }
            Err(error) => {
                warn!(?error, ?address, method = %request.method(), "Failed to send request");
                false
            }
        }
    }

    /// Encode the `store` request for `value` without sending it.
    fn check_store_size(&self, key: Id, value: &Value) -> Result<()> {
        let request = Request {
            sender_id: self.id,
            request_type: RequestSpecific::Store {
                key,
                value: value.clone(),
            },
        };

        Frame::encode_request(MessageId::random(), &request).map(|_| ())
    }

    fn call_store(&mut self, node: &Node, key: Id, value: Value, purpose: Purpose) -> bool {
        self.call(
            Some(node.id),
            node.address,
            RequestSpecific::Store { key, value },
            purpose,
        )
    }

    /// Every call ends here exactly once, with a response or `None` on timeout.
    fn handle_call_result(
        &mut self,
        message_id: MessageId,
        from: SocketAddr,
        response: Option<Response>,
    ) {
        let Some(call) = self.calls.remove(&message_id) else {
            return;
        };

        let node_id = match &response {
            Some(Response::Ping(id)) => Some(*id),
            _ => call.node_id,
        };

        self.handle_rpc_result(node_id, from, response.is_some());

        match call.purpose {
            Purpose::Crawl(operation_id) => {
                if let (Some(Operation::Crawl { crawl, .. }), Some(id)) =
                    (self.operations.get_mut(&operation_id), node_id)
                {
                    crawl.handle_response(&id, response);
                }

                self.advance_crawl(operation_id);
            }
            Purpose::BootstrapPing(operation_id) => {
                let responder = node_id
                    .filter(|_| response.is_some())
                    .map(|id| Node::new(id, from));

                self.bootstrap_ping_result(operation_id, responder);
            }
            Purpose::Store(operation_id) => {
                self.store_result(operation_id, response.is_some());
            }
            Purpose::Probe | Purpose::Replicate => {}
        }
    }

    /// Welcome nodes that respond, forget nodes that don't.
    fn handle_rpc_result(&mut self, node_id: Option<Id>, address: SocketAddr, success: bool) {
        let Some(id) = node_id else {
            return;
        };

        if success {
            server::welcome_if_new(self, Node::new(id, address));
        } else {
            debug!(?id, ?address, "No response, removing from routing table");
            self.routing_table.remove_contact(&id);
        }
    }

    fn bootstrap_ping_result(&mut self, operation_id: OperationId, responder: Option<Node>) {
        let Some(Operation::Bootstrap { pending, found, .. }) =
            self.operations.get_mut(&operation_id)
        else {
            return;
        };

        *pending -= 1;
        found.extend(responder);

        if *pending > 0 {
            return;
        }

        if let Some(Operation::Bootstrap { found, reply, .. }) =
            self.operations.remove(&operation_id)
        {
            self.bootstrap_crawl(found, reply);
        }
    }

    fn bootstrap_crawl(&mut self, seeds: Vec<Node>, reply: Option<Sender<Vec<Node>>>) {
        debug!(responding = seeds.len(), "Bootstrapping from responding nodes");

        let crawl = SpiderCrawl::new(CrawlKind::Node, self.id, seeds, self.k, self.alpha);
        self.start_crawl(crawl, AfterCrawl::Bootstrap(reply));
    }

    fn start_crawl(&mut self, crawl: SpiderCrawl, then: AfterCrawl) {
        let operation_id = self.next_operation_id();

        self.operations
            .insert(operation_id, Operation::Crawl { crawl, then });

        self.advance_crawl(operation_id);
    }

    /// Start the next round once the current one is done, or finish the crawl.
    fn advance_crawl(&mut self, operation_id: OperationId) {
        loop {
            let Some(Operation::Crawl { crawl, .. }) = self.operations.get_mut(&operation_id)
            else {
                return;
            };

            if !crawl.is_round_done() {
                return;
            }

            if let Some(result) = crawl.finish_round() {
                if let Some(Operation::Crawl { then, .. }) = self.operations.remove(&operation_id)
                {
                    self.crawl_done(then, result);
                }
                return;
            }

            let target = *crawl.target();
            let request_type = match crawl.kind() {
                CrawlKind::Node => RequestSpecific::FindNode { target },
                CrawlKind::Value => RequestSpecific::FindValue { key: target },
            };

            for peer in crawl.next_round() {
                if !self.call(
                    Some(peer.id),
                    peer.address,
                    request_type.clone(),
                    Purpose::Crawl(operation_id),
                ) {
                    if let Some(Operation::Crawl { crawl, .. }) =
                        self.operations.get_mut(&operation_id)
                    {
                        crawl.handle_response(&peer.id, None);
                    }
                }
            }
        }
    }

    fn crawl_done(&mut self, then: AfterCrawl, result: CrawlResult) {
        match then {
            AfterCrawl::Bootstrap(reply) => {
                let nodes = match result {
                    CrawlResult::Nodes(nodes) => nodes,
                    _ => vec![],
                };

                info!(
                    found = nodes.len(),
                    table_size = self.routing_table.size(),
                    "Bootstrapped"
                );

                if let Some(reply) = reply {
                    let _ = reply.send(nodes);
                }
            }
            AfterCrawl::Refresh(refresh_id) => {
                let Some(Operation::Refresh { pending }) = self.operations.get_mut(&refresh_id)
                else {
                    return;
                };

                *pending -= 1;

                if *pending == 0 {
                    self.operations.remove(&refresh_id);
                    self.republish();
                }
            }
            AfterCrawl::Get { key, reply } => match result {
                CrawlResult::Value { value, repair } => {
                    if let Some(node) = repair {
                        debug!(?key, ?node, "Storing value on nearest node that lacked it");
                        self.call_store(&node, key, value.clone(), Purpose::Replicate);
                    }
                    let _ = reply.send(Some(value));
                }
                _ => {
                    let _ = reply.send(None);
                }
            },
            AfterCrawl::Set { key, value, reply } => {
                let nodes = match result {
                    CrawlResult::Nodes(nodes) => nodes,
                    _ => vec![],
                };

                self.store_on(key, value, nodes, reply);
            }
        }
    }

    /// Store on the nodes found nearest to `key`, and locally if we are
    /// nearer than the farthest of them.
    fn store_on(
        &mut self,
        key: Id,
        value: Value,
        nodes: Vec<Node>,
        reply: Option<Sender<Result<bool>>>,
    ) {
        let Some(farthest) = nodes.iter().map(|node| node.distance_to(&key)).max() else {
            debug!(?key, "Lookup found no nodes, storing locally");
            self.storage.set(key, value);

            if let Some(reply) = reply {
                let _ = reply.send(Ok(false));
            }
            return;
        };

        if self.id.xor(&key) < farthest {
            self.storage.set(key, value.clone());
        }

        let operation_id = self.next_operation_id();
        let mut pending = 0;

        for node in &nodes {
            if self.call_store(node, key, value.clone(), Purpose::Store(operation_id)) {
                pending += 1;
            }
        }

        debug!(?key, nodes = nodes.len(), "Storing value");

        if pending == 0 {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(false));
            }
            return;
        }

        self.operations.insert(
            operation_id,
            Operation::Store {
                pending,
                stored: false,
                reply,
            },
        );
    }

    fn store_result(&mut self, operation_id: OperationId, success: bool) {
        let Some(Operation::Store {
            pending, stored, ..
        }) = self.operations.get_mut(&operation_id)
        else {
            return;
        };

        *pending -= 1;
        *stored |= success;

        if *pending > 0 {
            return;
        }

        if let Some(Operation::Store {
            stored,
            reply: Some(reply),
            ..
        }) = self.operations.remove(&operation_id)
        {
            let _ = reply.send(Ok(stored));
        }
    }

    /// Look up a random Id in every bucket that wasn't looked up in the last
    /// hour, then republish values older than the refresh interval.
    fn refresh_table(&mut self) {
        let ids = self.routing_table.refresh_ids();
        self.refresh(ids);
    }

    /// Look up each of `ids`, and republish once all the lookups are done.
    fn refresh(&mut self, ids: Vec<Id>) {
        debug!(lonely_buckets = ids.len(), "Refreshing routing table");

        if ids.is_empty() {
            self.republish();
            return;
        }

        let refresh_id = self.next_operation_id();
        self.operations.insert(
            refresh_id,
            Operation::Refresh {
                pending: ids.len(),
            },
        );

        for id in ids {
            let seeds = self.routing_table.find_neighbors(&id, Some(self.alpha), None);
            let crawl = SpiderCrawl::new(CrawlKind::Node, id, seeds, self.k, self.alpha);

            self.start_crawl(crawl, AfterCrawl::Refresh(refresh_id));
        }
    }

    fn republish(&mut self) {
        let older = self.storage.iter_older_than(self.refresh_interval);

        if !older.is_empty() {
            debug!(values = older.len(), "Republishing");
        }

        for (key, value) in older {
            self.set(key, value, None);
        }
    }

    fn save_state_regularly(&mut self) {
        let Some(path) = self.state_path.clone() else {
            return;
        };

        if self
            .last_state_save
            .is_some_and(|last| last.elapsed() < self.save_state_frequency)
        {
            return;
        }

        self.last_state_save = Some(Instant::now());

        if let Err(error) = self.state().save(&path) {
            warn!(?error, ?path, "Failed to save state");
        }
    }
}
