//! Attribute naming: the quark tree and the recycling pool.

mod pool;
mod tree;

pub use pool::{AttributePool, PoolOrder};
pub use tree::{AttributeTree, PATH_SEPARATOR};
