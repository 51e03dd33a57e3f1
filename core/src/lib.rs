// Shared building blocks for the NoSQL-backed session store:
// - Error taxonomy
// - Configuration loading
// - Document model and the store adapter contract
// - Bundled adapters

// Export errors module - Shared error types
pub mod errors;
pub use errors::*;

// Export config module - Configuration loading
pub mod config;
pub use config::*;

// Export document module - Values, filters, updates
pub mod document;
pub use document::{Document, Filter, IndexSpec, Projection, Update, Value, WriteResult};

// Export store module - Document store adapter contract
pub mod store;
pub use store::{DocumentStore, DocumentStoreRef};

pub mod adapters;
