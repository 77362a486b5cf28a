//! Miscellaneous common structs used throughout the library.

mod id;
mod kbucket;
pub mod messages;
mod node;
mod node_heap;
mod routing_table;
mod storage;
mod value;

pub use id::*;
pub use kbucket::*;
pub use messages::*;
pub use node::*;
pub use node_heap::*;
pub use routing_table::*;
pub use storage::*;
pub use value::*;
