//! Persisted shape of a session.
//!
//! One document per session id:
//!
//! ```text
//! { id, created, accessed, valid, invalidated,
//!   version: { <contextId>: n },
//!   context: { <contextId>: { <encodedName>: value, ... } } }
//! ```

use std::collections::BTreeMap;

use chrono::Utc;
use nosql_session_core::document::get_path;
use nosql_session_core::{Document, DocumentStore, IndexSpec, SessionError, SessionResult, Value};

use crate::codec::{decode_name, encode_name, AttributeCodec, AttributeValue};

pub const ID: &str = "id";
pub const CREATED: &str = "created";
pub const ACCESSED: &str = "accessed";
pub const VALID: &str = "valid";
pub const INVALIDATED: &str = "invalidated";
pub const VERSION: &str = "version";
pub const CONTEXT: &str = "context";

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Path of a context's attribute sub-document.
pub fn context_path(context_id: &str) -> String {
    format!("{}.{}", CONTEXT, context_id)
}

pub fn attribute_path(context_id: &str, name: &str) -> String {
    format!("{}.{}.{}", CONTEXT, context_id, encode_name(name))
}

pub fn version_path(context_id: &str) -> String {
    format!("{}.{}", VERSION, context_id)
}

/// Ensure the indexes every session collection needs. Idempotent.
pub async fn ensure_indexes(documents: &dyn DocumentStore) -> SessionResult<()> {
    documents.ensure_index(&IndexSpec::unique([ID])).await?;
    documents.ensure_index(&IndexSpec::unique([ID, VERSION])).await?;
    Ok(())
}

/// One session's persisted view, as seen from a single context.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub created: i64,
    pub accessed: i64,
    pub valid: bool,
    pub invalidated: Option<i64>,
    /// This context's version counter; absent until the context first saves.
    pub version: Option<i64>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl SessionRecord {
    /// Read a stored document, decoding only the attributes of `context_id`.
    pub fn from_document(
        doc: &Document,
        context_id: &str,
        codec: &AttributeCodec,
    ) -> SessionResult<Self> {
        let id = doc
            .get(ID)
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::InvalidDocument("session document has no id".into()))?
            .to_string();

        let created = doc.get(CREATED).and_then(Value::as_i64).unwrap_or_default();
        let accessed = doc.get(ACCESSED).and_then(Value::as_i64).unwrap_or(created);

        Ok(Self {
            valid: is_valid(doc),
            invalidated: doc.get(INVALIDATED).and_then(Value::as_i64),
            version: stored_version(doc, context_id),
            attributes: decode_attributes(doc, context_id, codec)?,
            id,
            created,
            accessed,
        })
    }
}

/// Absent or non-boolean `valid` counts as invalid.
pub fn is_valid(doc: &Document) -> bool {
    doc.get(VALID).and_then(Value::as_bool).unwrap_or(false)
}

pub fn stored_version(doc: &Document, context_id: &str) -> Option<i64> {
    get_path(doc, &version_path(context_id)).and_then(Value::as_i64)
}

/// Decode every attribute stored for `context_id`.
pub fn decode_attributes(
    doc: &Document,
    context_id: &str,
    codec: &AttributeCodec,
) -> SessionResult<BTreeMap<String, AttributeValue>> {
    let mut attributes = BTreeMap::new();
    if let Some(stored) = get_path(doc, &context_path(context_id)).and_then(Value::as_document) {
        for (name, value) in stored {
            attributes.insert(decode_name(name), codec.decode_value(value)?);
        }
    }
    Ok(attributes)
}
