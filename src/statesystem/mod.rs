//! State systems: the write and query facade over a backend.

mod system;
mod transient;

pub use system::{StateSystem, MAX_STACK_DEPTH};
