#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod error;
mod state;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
pub mod rpc;

pub use crate::common::{messages, Id, Node, NodeHeap, RoutingTable, Storage, Value, KBucket};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, DhtWasShutdown, Testnet};
pub use error::{Error, Result};
pub use state::State;
