//! Attribute codec
//!
//! Converts session attribute values to and from document [`Value`]s. Every
//! attribute is one of three shapes, decided once at this boundary:
//!
//! * a scalar (bool, integer, double, string, timestamp), stored as-is;
//! * a string-keyed map of attributes, stored as a nested sub-document;
//! * an opaque application value, stored as a binary blob produced by a
//!   serializer the application registered for its type tag.
//!
//! Field names are escaped with [`encode_name`] because `.` separates path
//! segments in the store.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use nosql_session_core::{Document, SessionError, SessionResult, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Separates the type tag from the payload inside an opaque blob.
const TAG_SEPARATOR: u8 = 0;

/// Escape a field name so it is safe as a single path segment.
pub fn encode_name(name: &str) -> String {
    name.replace('%', "%25").replace('.', "%2E")
}

/// Inverse of [`encode_name`]. The substitutions run in the opposite order.
pub fn decode_name(name: &str) -> String {
    name.replace("%2E", ".").replace("%25", "%")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

/// An application value registered with the codec under a type tag.
pub trait OpaqueAttribute: Any + Debug + Send + Sync {
    fn to_bytes(&self) -> SessionResult<Vec<u8>>;
    fn dyn_eq(&self, other: &dyn OpaqueAttribute) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<T> OpaqueAttribute for T
where
    T: Serialize + PartialEq + Debug + Send + Sync + 'static,
{
    fn to_bytes(&self) -> SessionResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SessionError::Encoding(e.to_string()))
    }

    fn dyn_eq(&self, other: &dyn OpaqueAttribute) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An opaque attribute together with the tag its codec entry is registered under.
#[derive(Clone)]
pub struct OpaqueValue {
    type_tag: String,
    value: Arc<dyn OpaqueAttribute>,
}

impl OpaqueValue {
    pub fn new<T: OpaqueAttribute>(type_tag: impl Into<String>, value: T) -> Self {
        Self {
            type_tag: type_tag.into(),
            value: Arc::new(value),
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.as_any().downcast_ref::<T>()
    }
}

impl Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueValue")
            .field("type_tag", &self.type_tag)
            .field("value", &self.value)
            .finish()
    }
}

impl PartialEq for OpaqueValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_tag == other.type_tag && self.value.dyn_eq(other.value.as_ref())
    }
}

/// A session attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Scalar(Scalar),
    Map(BTreeMap<String, AttributeValue>),
    Opaque(OpaqueValue),
}

impl AttributeValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Scalar(Scalar::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Scalar(Scalar::Bool(b))
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Scalar(Scalar::Int(i))
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        AttributeValue::Scalar(Scalar::Int(i64::from(i)))
    }
}

impl From<f64> for AttributeValue {
    fn from(d: f64) -> Self {
        AttributeValue::Scalar(Scalar::Double(d))
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Scalar(Scalar::String(s.to_string()))
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Scalar(Scalar::String(s))
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(t: DateTime<Utc>) -> Self {
        AttributeValue::Scalar(Scalar::Timestamp(t))
    }
}

impl From<BTreeMap<String, AttributeValue>> for AttributeValue {
    fn from(m: BTreeMap<String, AttributeValue>) -> Self {
        AttributeValue::Map(m)
    }
}

impl From<OpaqueValue> for AttributeValue {
    fn from(o: OpaqueValue) -> Self {
        AttributeValue::Opaque(o)
    }
}

type DecodeFn = dyn Fn(&[u8]) -> SessionResult<Arc<dyn OpaqueAttribute>> + Send + Sync;

/// Encodes attributes for storage. Holds the registry of opaque types.
#[derive(Default)]
pub struct AttributeCodec {
    decoders: RwLock<HashMap<String, Arc<DecodeFn>>>,
}

impl Debug for AttributeCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<String> = self
            .decoders
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("AttributeCodec")
            .field("registered", &tags)
            .finish()
    }
}

impl AttributeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as an opaque attribute type stored under `type_tag`.
    pub fn register<T>(&self, type_tag: &str) -> SessionResult<()>
    where
        T: Serialize + DeserializeOwned + PartialEq + Debug + Send + Sync + 'static,
    {
        if type_tag.is_empty() || type_tag.as_bytes().contains(&TAG_SEPARATOR) {
            return Err(SessionError::Config(format!(
                "invalid opaque type tag: {:?}",
                type_tag
            )));
        }
        let decode: Arc<DecodeFn> = Arc::new(|bytes: &[u8]| {
            let value: T = serde_json::from_slice(bytes)
                .map_err(|e| SessionError::Decoding(e.to_string()))?;
            Ok(Arc::new(value) as Arc<dyn OpaqueAttribute>)
        });
        self.decoders
            .write()
            .map_err(|e| SessionError::Config(format!("codec registry poisoned: {}", e)))?
            .insert(type_tag.to_string(), decode);
        Ok(())
    }

    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.decoders
            .read()
            .map(|d| d.contains_key(type_tag))
            .unwrap_or(false)
    }

    fn decoder(&self, type_tag: &str) -> SessionResult<Arc<DecodeFn>> {
        let decoders = self
            .decoders
            .read()
            .map_err(|e| SessionError::Decoding(format!("codec registry poisoned: {}", e)))?;
        decoders
            .get(type_tag)
            .cloned()
            .ok_or_else(|| SessionError::Decoding(format!("unknown opaque type: {}", type_tag)))
    }

    pub fn encode_value(&self, value: &AttributeValue) -> SessionResult<Value> {
        match value {
            AttributeValue::Scalar(scalar) => Ok(match scalar {
                Scalar::Bool(b) => Value::Bool(*b),
                Scalar::Int(i) => Value::Int(*i),
                Scalar::Double(d) => Value::Double(*d),
                Scalar::String(s) => Value::String(s.clone()),
                Scalar::Timestamp(t) => Value::DateTime(*t),
            }),
            AttributeValue::Map(map) => {
                let mut doc = Document::new();
                for (name, entry) in map {
                    doc.insert(encode_name(name), self.encode_value(entry)?);
                }
                Ok(Value::Document(doc))
            }
            AttributeValue::Opaque(opaque) => {
                if !self.is_registered(&opaque.type_tag) {
                    return Err(SessionError::Encoding(format!(
                        "no serializer registered for {}",
                        opaque.type_tag
                    )));
                }
                let payload = opaque.value.to_bytes()?;
                let mut blob = Vec::with_capacity(opaque.type_tag.len() + 1 + payload.len());
                blob.extend_from_slice(opaque.type_tag.as_bytes());
                blob.push(TAG_SEPARATOR);
                blob.extend_from_slice(&payload);
                Ok(Value::Binary(blob))
            }
        }
    }

    pub fn decode_value(&self, value: &Value) -> SessionResult<AttributeValue> {
        match value {
            Value::Bool(b) => Ok(Scalar::Bool(*b).into()),
            Value::Int(i) => Ok(Scalar::Int(*i).into()),
            Value::Double(d) => Ok(Scalar::Double(*d).into()),
            Value::String(s) => Ok(Scalar::String(s.clone()).into()),
            Value::DateTime(t) => Ok(Scalar::Timestamp(*t).into()),
            Value::Document(doc) => {
                let mut map = BTreeMap::new();
                for (name, entry) in doc {
                    map.insert(decode_name(name), self.decode_value(entry)?);
                }
                Ok(AttributeValue::Map(map))
            }
            Value::Binary(blob) => {
                let split = blob
                    .iter()
                    .position(|b| *b == TAG_SEPARATOR)
                    .ok_or_else(|| SessionError::Decoding("opaque blob has no type tag".into()))?;
                let type_tag = std::str::from_utf8(&blob[..split])
                    .map_err(|e| SessionError::Decoding(format!("bad type tag: {}", e)))?;
                let decode = self.decoder(type_tag)?;
                let value = decode(&blob[split + 1..])?;
                Ok(AttributeValue::Opaque(OpaqueValue {
                    type_tag: type_tag.to_string(),
                    value,
                }))
            }
            Value::Null => Err(SessionError::Decoding(
                "null is not a storable attribute".to_string(),
            )),
        }
    }
}

impl From<Scalar> for AttributeValue {
    fn from(s: Scalar) -> Self {
        AttributeValue::Scalar(s)
    }
}
