//! [`DocumentStore`](crate::store::DocumentStore) implementations.

pub mod memory;

pub use memory::{MemoryConnector, MemoryStore};
