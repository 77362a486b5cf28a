//! Micro-benchmarks for RoutingTable operations: add_contact, find_neighbors
//! and remove_contact at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use std::net::SocketAddr;
use std::time::Instant;

use kadnode::{Id, Node, RoutingTable};

const K: usize = 20;

fn main() {
    println!("routing_table\n");

    bench_add_contact();
    bench_find_neighbors();
    bench_remove_contact();
}

fn address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8468))
}

fn filled(size: usize) -> RoutingTable {
    let mut table = RoutingTable::new(Id::random(), K);
    for _ in 0..size {
        table.add_contact(Node::new(Id::random(), address()));
    }
    table
}

fn bench_add_contact() {
    println!("add_contact");

    // Pre-generate random nodes outside the timed section
    let nodes: Vec<_> = (0..1000)
        .map(|_| Node::new(Id::random(), address()))
        .collect();

    for size in [0, 100, 400] {
        let mut table = filled(size);

        let start = Instant::now();
        for node in nodes.iter().cloned() {
            table.add_contact(node);
        }
        let per_op = start.elapsed().as_nanos() / nodes.len() as u128;
        println!(
            "{size:>3} nodes:  {per_op}ns/op (final size: {}, buckets: {})",
            table.size(),
            table.buckets().len()
        );
    }

    println!();
}

fn bench_find_neighbors() {
    println!("find_neighbors");

    let targets: Vec<_> = (0..1000).map(|_| Id::random()).collect();

    for size in [50, 100, 200, 400] {
        let mut table = filled(size);

        let start = Instant::now();
        for target in &targets {
            let _ = table.find_neighbors(target, None, None);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>3} nodes: {per_op}ns/op");
    }

    println!();
}

fn bench_remove_contact() {
    println!("remove_contact");

    let mut table = filled(200);
    let ids: Vec<_> = table.nodes().map(|node| node.id).collect();

    let n = ids.len();
    let start = Instant::now();
    for id in &ids {
        table.remove_contact(id);
    }
    let per_op = start.elapsed().as_nanos() / n.max(1) as u128;
    println!("{per_op}ns/op ({n} removals)");
    println!();
}
