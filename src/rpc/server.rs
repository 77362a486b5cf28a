//! Request handlers

use std::net::SocketAddr;

use tracing::{debug, info, trace};

use crate::common::{MessageId, Node, Request, RequestSpecific, Response};

use super::{Purpose, Rpc};

pub fn handle_request(rpc: &mut Rpc, from: SocketAddr, message_id: MessageId, request: Request) {
    let requester_id = request.sender_id;

    welcome_if_new(rpc, Node::new(requester_id, from));

    let response = match request.request_type {
        RequestSpecific::Ping => Response::Ping(rpc.id),
        RequestSpecific::Store { key, value } => {
            debug!(?key, ?requester_id, ?from, "Storing value");
            rpc.storage.set(key, value);

            Response::Stored
        }
        RequestSpecific::FindNode { target } => {
            trace!(?target, ?requester_id, "Finding neighbors");

            Response::Nodes(
                rpc.routing_table
                    .find_neighbors(&target, None, Some(&from)),
            )
        }
        RequestSpecific::FindValue { key } => match rpc.storage.get(&key) {
            Some(value) => Response::Value(value.clone()),
            None => Response::Nodes(rpc.routing_table.find_neighbors(&key, None, Some(&from))),
        },
    };

    rpc.socket.response(from, message_id, &response);
}

/// Add a node we haven't seen before to the routing table, and hand it the
/// stored values it should hold.
///
/// A value is handed over if we know no other node near its key, or if both
/// the new node and this node are among the `k` nearest to it. If the new
/// node's bucket is full, its least recently seen node is pinged, and
/// dropped in favor of the new node if it doesn't respond.
pub fn welcome_if_new(rpc: &mut Rpc, node: Node) {
    if node.id == rpc.id || !rpc.routing_table.is_new_node(&node.id) {
        return;
    }

    info!(
        id = ?node.id,
        address = ?node.address,
        "Never seen node before, adding to routing table"
    );

    let stored = rpc
        .storage
        .iter()
        .map(|(key, value)| (*key, value.clone()))
        .collect::<Vec<_>>();

    for (key, value) in stored {
        let neighbors = rpc.routing_table.find_neighbors(&key, None, None);

        let replicate = match neighbors.last() {
            None => true,
            Some(farthest) => {
                let full = neighbors.len() >= rpc.k;
                let farthest = farthest.distance_to(&key);

                let new_node_close = !full || node.distance_to(&key) < farthest;
                let this_closest = !full || rpc.id.xor(&key) < farthest;

                new_node_close && this_closest
            }
        };

        if replicate {
            trace!(?key, to = ?node.address, "Replicating value to new node");
            rpc.call_store(&node, key, value, Purpose::Replicate);
        }
    }

    if let Some(head) = rpc.routing_table.add_contact(node) {
        rpc.call(
            Some(head.id),
            head.address,
            RequestSpecific::Ping,
            Purpose::Probe,
        );
    }
}
