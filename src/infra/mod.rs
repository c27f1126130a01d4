//! Infrastructure adapters for task persistence.

pub mod store;

pub use store::{FileStore, JsonStore, MemoryStore, Store};
