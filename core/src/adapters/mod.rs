//! Document store adapters bundled with the core crate.

mod in_memory;

pub use in_memory::{CallStats, InMemoryDocumentStore};
