// Distributed HTTP session store over a shared document collection:
// - Attribute codec and per-context record layout
// - Session store with optimistic per-context versioning
// - Session proxies and the per-context manager
// - Node id registry, scavenger and cross-context invalidation
// - Purger

pub mod codec;
pub mod context;
pub mod lifecycle;
pub mod manager;
pub mod proxy;
pub mod purger;
pub mod record;
pub mod registry;
mod schedule;
pub mod store;

pub use codec::{AttributeCodec, AttributeValue, OpaqueValue, Scalar};
pub use context::context_id;
pub use lifecycle::{NoopListener, SessionListener, SessionListenerRef};
pub use manager::SessionManager;
pub use proxy::{SessionProxy, SessionState};
pub use purger::SessionPurger;
pub use record::SessionRecord;
pub use registry::{IdRegistry, SessionInvalidator, SubscriptionId};
pub use store::{RefreshOutcome, SessionStore};
