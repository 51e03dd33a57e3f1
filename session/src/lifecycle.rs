use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::codec::AttributeValue;

/// Notifications an application receives as sessions move in and out of memory.
///
/// All methods default to no-ops. They run while the session's state is
/// locked, so implementations must not call back into the same session.
pub trait SessionListener: Send + Sync + Debug {
    /// The session's attributes are about to be written out or replaced.
    fn will_passivate(&self, _session_id: &str, _attributes: &BTreeMap<String, AttributeValue>) {}

    /// The session's attributes are live in memory again.
    fn did_activate(&self, _session_id: &str, _attributes: &BTreeMap<String, AttributeValue>) {}

    /// A value was bound to `name`, by the application or by a reload.
    fn value_bound(&self, _session_id: &str, _name: &str, _value: &AttributeValue) {}

    /// A value was unbound from `name`.
    fn value_unbound(&self, _session_id: &str, _name: &str, _value: &AttributeValue) {}
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Type alias for Arc-wrapped SessionListener trait objects
pub type SessionListenerRef = Arc<dyn SessionListener>;
