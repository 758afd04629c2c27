//! Values that can be passed to a remote function.
//!
//! An [`RpcValue`] is a JSON-like tree that may also hold binary payloads
//! ([`Blob`]) and live callables ([`Function`]). The codec replaces the latter
//! two with references when a call leaves this process and rebuilds them on
//! the other side.

use crate::error::WireResult;
use bytes::Bytes;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Something that can be invoked with positional arguments.
///
/// Invocations never return a value: results travel back through callbacks
/// passed as arguments.
pub trait Callable: Send + Sync {
    fn call(&self, args: Vec<RpcValue>) -> WireResult<()>;
}

impl<F> Callable for F
where
    F: Fn(Vec<RpcValue>) -> WireResult<()> + Send + Sync,
{
    fn call(&self, args: Vec<RpcValue>) -> WireResult<()> {
        self(args)
    }
}

/// A live function value.
///
/// Once exposed to a peer, a function is forgotten after its first remote
/// invocation unless it is marked as kept. The flag is shared between clones
/// and read at dispatch time, so it can be cleared after exposure to let the
/// next invocation retire the handle.
#[derive(Clone)]
pub struct Function {
    callable: Arc<dyn Callable>,
    keep: Arc<AtomicBool>,
}

impl Function {
    /// A one-shot function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> WireResult<()> + Send + Sync + 'static,
    {
        Self::from_callable(Arc::new(f))
    }

    /// A function that stays reachable after being invoked.
    pub fn kept<F>(f: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> WireResult<()> + Send + Sync + 'static,
    {
        let function = Self::new(f);
        function.set_kept(true);
        function
    }

    pub fn from_callable(callable: Arc<dyn Callable>) -> Self {
        Self {
            callable,
            keep: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn call(&self, args: Vec<RpcValue>) -> WireResult<()> {
        self.callable.call(args)
    }

    pub fn is_kept(&self) -> bool {
        self.keep.load(Ordering::Acquire)
    }

    pub fn set_kept(&self, keep: bool) {
        self.keep.store(keep, Ordering::Release);
    }

    /// Whether both values wrap the same callable.
    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.callable, &other.callable)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("kept", &self.is_kept())
            .finish_non_exhaustive()
    }
}

/// A binary payload.
///
/// Equality compares content; [`Blob::is_same`] compares identity, which is
/// what the encoder uses to send a payload only once per call.
#[derive(Clone, Debug)]
pub struct Blob(Bytes);

impl Blob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when both blobs view the same buffer.
    pub fn is_same(&self, other: &Blob) -> bool {
        self.0.as_ptr() == other.0.as_ptr() && self.0.len() == other.0.len()
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Blob {}

/// An argument tree.
#[derive(Clone, Debug, Default)]
pub enum RpcValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<RpcValue>),
    Object(BTreeMap<String, RpcValue>),
    Blob(Blob),
    Function(Function),
    /// A handle to a host resource that only means something locally (an
    /// open storage transaction, for instance). Never sent: omitted from
    /// objects and turned into `null` inside arrays. The receiver is expected
    /// to recreate whatever it stood for.
    Transient,
}

impl RpcValue {
    /// Build an object from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, RpcValue)>,
    {
        RpcValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        match self {
            RpcValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match self {
            RpcValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            RpcValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            RpcValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RpcValue::Null)
    }

    /// Plain JSON view of this value.
    ///
    /// Blobs, functions and transient handles have no JSON form: they are
    /// omitted from objects and become `null` inside arrays.
    pub fn to_json(&self) -> Value {
        self.json_entry().unwrap_or(Value::Null)
    }

    fn json_entry(&self) -> Option<Value> {
        match self {
            RpcValue::Null => Some(Value::Null),
            RpcValue::Bool(b) => Some(Value::Bool(*b)),
            RpcValue::Number(n) => Some(Value::Number(n.clone())),
            RpcValue::String(s) => Some(Value::String(s.clone())),
            RpcValue::Array(items) => Some(Value::Array(
                items.iter().map(RpcValue::to_json).collect(),
            )),
            RpcValue::Object(map) => Some(Value::Object(
                map.iter()
                    .filter_map(|(k, v)| v.json_entry().map(|v| (k.clone(), v)))
                    .collect::<Map<String, Value>>(),
            )),
            RpcValue::Blob(_) | RpcValue::Function(_) | RpcValue::Transient => None,
        }
    }
}

impl From<Value> for RpcValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RpcValue::Null,
            Value::Bool(b) => RpcValue::Bool(b),
            Value::Number(n) => RpcValue::Number(n),
            Value::String(s) => RpcValue::String(s),
            Value::Array(items) => RpcValue::Array(items.into_iter().map(RpcValue::from).collect()),
            Value::Object(map) => {
                RpcValue::Object(map.into_iter().map(|(k, v)| (k, RpcValue::from(v))).collect())
            }
        }
    }
}

impl From<&str> for RpcValue {
    fn from(s: &str) -> Self {
        RpcValue::String(s.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(s: String) -> Self {
        RpcValue::String(s)
    }
}

impl From<bool> for RpcValue {
    fn from(b: bool) -> Self {
        RpcValue::Bool(b)
    }
}

impl From<u64> for RpcValue {
    fn from(n: u64) -> Self {
        RpcValue::Number(n.into())
    }
}

impl From<Bytes> for RpcValue {
    fn from(data: Bytes) -> Self {
        RpcValue::Blob(Blob(data))
    }
}

impl From<Blob> for RpcValue {
    fn from(blob: Blob) -> Self {
        RpcValue::Blob(blob)
    }
}

impl From<Function> for RpcValue {
    fn from(f: Function) -> Self {
        RpcValue::Function(f)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(items: Vec<RpcValue>) -> Self {
        RpcValue::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kept_flag_is_shared_between_clones() {
        let f = Function::kept(|_| Ok(()));
        let clone = f.clone();
        assert!(clone.is_kept());
        f.set_kept(false);
        assert!(!clone.is_kept());
        assert!(f.ptr_eq(&clone));
    }

    #[test]
    fn test_blob_identity_vs_content() {
        let a = Blob::new(Bytes::from(vec![1u8, 2, 3]));
        let b = Blob::new(Bytes::from(vec![1u8, 2, 3]));
        assert_eq!(a, b);
        assert!(!a.is_same(&b));
        assert!(a.is_same(&a.clone()));
    }

    #[test]
    fn test_to_json_drops_live_values() {
        let value = RpcValue::object([
            ("name", RpcValue::from("doc")),
            ("cb", RpcValue::Function(Function::new(|_| Ok(())))),
            ("ctx", RpcValue::Transient),
            (
                "list",
                RpcValue::Array(vec![RpcValue::from(1u64), RpcValue::Transient]),
            ),
        ]);
        assert_eq!(value.to_json(), json!({"name": "doc", "list": [1, null]}));
    }

    #[test]
    fn test_from_json_roundtrip() {
        let original = json!({"a": [1, "two", true, null], "b": {"c": 3.5}});
        assert_eq!(RpcValue::from(original.clone()).to_json(), original);
    }
}
