//! Call serialization.
//!
//! One call `{fn, args}` becomes zero or more binary frames followed by one
//! text frame holding the JSON envelope. While walking the arguments:
//!
//! - a [`Function`] becomes `{"__remote_fn": "<handle id>"}`, after being
//!   handed to the caller's `expose` hook which registers it under that id;
//! - a [`Blob`] becomes `{"__blob": n}`, where `n` is its 1-based position among
//!   this call's binary frames (the same buffer used twice gets one frame);
//! - a transient handle is dropped.
//!
//! The receiver buffers binary frames in arrival order and resolves `__blob`
//! references against that buffer when the envelope arrives, so the binary
//! frames must be sent, in order, before the envelope.

use crate::error::{WireError, WireResult};
use crate::transport::Frame;
use crate::value::{Blob, Function, RpcValue};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key marking a remote function handle.
pub const REMOTE_FN_KEY: &str = "__remote_fn";

/// Key marking a binary frame reference.
pub const BLOB_KEY: &str = "__blob";

/// A decoded call.
#[derive(Debug, Clone)]
pub struct Call {
    /// Id of the function to invoke.
    pub fn_id: String,
    /// Positional arguments.
    pub args: Vec<RpcValue>,
}

/// Encode one call into the frames to put on the wire, in order.
///
/// `expose` is invoked for every function found in the arguments and must
/// return the handle id the peer will use to call it back.
pub fn encode_call(
    fn_id: &str,
    args: &[RpcValue],
    expose: &mut dyn FnMut(&Function) -> String,
) -> WireResult<Vec<Frame>> {
    let mut encoder = Encoder {
        blobs: Vec::new(),
        expose,
    };
    let args: Vec<Value> = args
        .iter()
        .map(|arg| encoder.encode(arg).unwrap_or(Value::Null))
        .collect();

    let mut envelope = Map::new();
    envelope.insert("fn".into(), Value::String(fn_id.to_string()));
    envelope.insert("args".into(), Value::Array(args));
    let text = serde_json::to_string(&Value::Object(envelope))?;

    let mut frames: Vec<Frame> = encoder
        .blobs
        .into_iter()
        .map(|blob| Frame::Binary(blob.into_bytes()))
        .collect();
    frames.push(Frame::Text(text));
    Ok(frames)
}

struct Encoder<'a> {
    blobs: Vec<Blob>,
    expose: &'a mut dyn FnMut(&Function) -> String,
}

impl Encoder<'_> {
    /// `None` means "leave this value out".
    fn encode(&mut self, value: &RpcValue) -> Option<Value> {
        match value {
            RpcValue::Null => Some(Value::Null),
            RpcValue::Bool(b) => Some(Value::Bool(*b)),
            RpcValue::Number(n) => Some(Value::Number(n.clone())),
            RpcValue::String(s) => Some(Value::String(s.clone())),
            RpcValue::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| self.encode(item).unwrap_or(Value::Null))
                    .collect(),
            )),
            RpcValue::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    if let Some(encoded) = self.encode(item) {
                        out.insert(key.clone(), encoded);
                    }
                }
                Some(Value::Object(out))
            }
            RpcValue::Function(f) => {
                let id = (self.expose)(f);
                Some(marker(REMOTE_FN_KEY, Value::String(id)))
            }
            RpcValue::Blob(blob) => {
                let index = match self.blobs.iter().position(|b| b.is_same(blob)) {
                    Some(pos) => pos + 1,
                    None => {
                        self.blobs.push(blob.clone());
                        self.blobs.len()
                    }
                };
                Some(marker(BLOB_KEY, Value::from(index as u64)))
            }
            RpcValue::Transient => None,
        }
    }
}

fn marker(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// Decode a call envelope.
///
/// `blobs` are the binary frames received since the previous envelope;
/// `proxy` turns a remote handle id into a local function that calls it.
pub fn decode_call(
    text: &str,
    blobs: &[Bytes],
    proxy: &dyn Fn(String) -> Function,
) -> WireResult<Call> {
    let envelope: Value = serde_json::from_str(text)?;
    let Value::Object(mut envelope) = envelope else {
        return Err(WireError::Codec("envelope is not an object".into()));
    };
    let fn_id = match envelope.remove("fn") {
        Some(Value::String(id)) => id,
        _ => return Err(WireError::Codec("missing function id".into())),
    };
    let args = match envelope.remove("args") {
        Some(Value::Array(args)) => args,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(WireError::Codec("args is not an array".into())),
    };

    let decoder = Decoder { blobs, proxy };
    let args = args
        .into_iter()
        .map(|arg| decoder.decode(arg))
        .collect::<WireResult<Vec<_>>>()?;
    Ok(Call { fn_id, args })
}

struct Decoder<'a> {
    blobs: &'a [Bytes],
    proxy: &'a dyn Fn(String) -> Function,
}

impl Decoder<'_> {
    fn decode(&self, value: Value) -> WireResult<RpcValue> {
        match value {
            Value::Array(items) => Ok(RpcValue::Array(
                items
                    .into_iter()
                    .map(|item| self.decode(item))
                    .collect::<WireResult<Vec<_>>>()?,
            )),
            Value::Object(map) => {
                if let Some(id) = map.get(REMOTE_FN_KEY).and_then(Value::as_str) {
                    if !id.is_empty() {
                        return Ok(RpcValue::Function((self.proxy)(id.to_string())));
                    }
                }
                if let Some(index) = map.get(BLOB_KEY).and_then(Value::as_u64) {
                    if index > 0 {
                        return self.blob(index);
                    }
                }
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    out.insert(key, self.decode(item)?);
                }
                Ok(RpcValue::Object(out))
            }
            other => Ok(RpcValue::from(other)),
        }
    }

    fn blob(&self, index: u64) -> WireResult<RpcValue> {
        usize::try_from(index - 1)
            .ok()
            .and_then(|i| self.blobs.get(i))
            .map(|data| RpcValue::Blob(Blob::new(data.clone())))
            .ok_or_else(|| {
                WireError::Codec(format!(
                    "blob reference {index} but only {} binary frames buffered",
                    self.blobs.len()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn counting_expose() -> (Arc<Mutex<Vec<Function>>>, impl FnMut(&Function) -> String) {
        let exposed = Arc::new(Mutex::new(Vec::new()));
        let sink = exposed.clone();
        let expose = move |f: &Function| {
            let mut list = sink.lock().unwrap();
            list.push(f.clone());
            format!("h{}", list.len())
        };
        (exposed, expose)
    }

    fn text_of(frame: &Frame) -> Value {
        match frame {
            Frame::Text(t) => serde_json::from_str(t).unwrap(),
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_call_is_single_envelope() {
        let (_, mut expose) = counting_expose();
        let frames = encode_call(
            "f1",
            &[RpcValue::from(json!({"a": 1})), RpcValue::from("x")],
            &mut expose,
        )
        .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(text_of(&frames[0]), json!({"fn": "f1", "args": [{"a": 1}, "x"]}));
    }

    #[test]
    fn test_binary_frames_precede_envelope_in_first_use_order() {
        let (_, mut expose) = counting_expose();
        let first = Blob::new(Bytes::from_static(b"first"));
        let second = Blob::new(Bytes::from(b"second".to_vec()));
        let frames = encode_call(
            "put",
            &[
                RpcValue::object([("b", RpcValue::Blob(second.clone()))]),
                RpcValue::Array(vec![RpcValue::Blob(first.clone())]),
            ],
            &mut expose,
        )
        .unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Frame::Binary(Bytes::from(b"second".to_vec())));
        assert_eq!(frames[1], Frame::Binary(Bytes::from_static(b"first")));
        assert_eq!(
            text_of(&frames[2]),
            json!({"fn": "put", "args": [{"b": {"__blob": 1}}, [{"__blob": 2}]]})
        );
    }

    #[test]
    fn test_same_blob_sent_once() {
        let (_, mut expose) = counting_expose();
        let blob = Blob::new(Bytes::from(vec![7u8; 16]));
        let frames = encode_call(
            "dup",
            &[RpcValue::Blob(blob.clone()), RpcValue::Blob(blob)],
            &mut expose,
        )
        .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(
            text_of(&frames[1]),
            json!({"fn": "dup", "args": [{"__blob": 1}, {"__blob": 1}]})
        );
    }

    #[test]
    fn test_functions_are_exposed_and_referenced() {
        let (exposed, mut expose) = counting_expose();
        let cb = Function::new(|_| Ok(()));
        let frames = encode_call(
            "get",
            &[RpcValue::from("doc-1"), RpcValue::Function(cb.clone())],
            &mut expose,
        )
        .unwrap();
        assert_eq!(
            text_of(&frames[0]),
            json!({"fn": "get", "args": ["doc-1", {"__remote_fn": "h1"}]})
        );
        let exposed = exposed.lock().unwrap();
        assert_eq!(exposed.len(), 1);
        assert!(exposed[0].ptr_eq(&cb));
    }

    #[test]
    fn test_transient_values_are_dropped() {
        let (_, mut expose) = counting_expose();
        let frames = encode_call(
            "bulk",
            &[
                RpcValue::object([("ctx", RpcValue::Transient), ("new_edits", true.into())]),
                RpcValue::Transient,
            ],
            &mut expose,
        )
        .unwrap();
        assert_eq!(
            text_of(&frames[0]),
            json!({"fn": "bulk", "args": [{"new_edits": true}, null]})
        );
    }

    #[test]
    fn test_decode_reconstructs_blobs_and_proxies() {
        let (_, mut expose) = counting_expose();
        let payload = Blob::new(Bytes::from(vec![0u8, 255, 1]));
        let frames = encode_call(
            "attach",
            &[
                RpcValue::object([
                    ("data", RpcValue::Blob(payload.clone())),
                    ("nested", RpcValue::Array(vec![RpcValue::Blob(payload.clone())])),
                ]),
                RpcValue::Function(Function::new(|_| Ok(()))),
            ],
            &mut expose,
        )
        .unwrap();

        let mut blobs = Vec::new();
        let mut text = None;
        for frame in frames {
            match frame {
                Frame::Binary(b) => blobs.push(b),
                Frame::Text(t) => text = Some(t),
            }
        }

        let invoked = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = invoked.clone();
        let proxy = move |id: String| {
            let sink = sink.clone();
            Function::new(move |_| {
                sink.lock().unwrap().push(id.clone());
                Ok(())
            })
        };
        let call = decode_call(&text.unwrap(), &blobs, &proxy).unwrap();
        assert_eq!(call.fn_id, "attach");
        assert_eq!(call.args.len(), 2);

        let first = &call.args[0];
        assert_eq!(first.get("data").and_then(RpcValue::as_blob), Some(&payload));
        match first.get("nested") {
            Some(RpcValue::Array(items)) => assert_eq!(items[0].as_blob(), Some(&payload)),
            other => panic!("Expected array, got {other:?}"),
        }

        call.args[1].as_function().unwrap().call(vec![]).unwrap();
        assert_eq!(*invoked.lock().unwrap(), vec!["h1".to_string()]);
    }

    #[test]
    fn test_decode_rejects_dangling_blob_reference() {
        let proxy = |_: String| Function::new(|_| Ok(()));
        let err = decode_call(r#"{"fn":"x","args":[{"__blob":2}]}"#, &[Bytes::new()], &proxy)
            .unwrap_err();
        assert!(matches!(err, WireError::Codec(_)));
    }

    #[test]
    fn test_decode_rejects_non_envelope() {
        let proxy = |_: String| Function::new(|_| Ok(()));
        assert!(decode_call("\"hello\"", &[], &proxy).is_err());
        assert!(decode_call("{not json", &[], &proxy).is_err());
        assert!(decode_call(r#"{"args":[]}"#, &[], &proxy).is_err());
    }

    #[test]
    fn test_falsy_markers_are_plain_objects() {
        let proxy = |_: String| Function::new(|_| Ok(()));
        let call = decode_call(
            r#"{"fn":"x","args":[{"__remote_fn":""},{"__blob":0}]}"#,
            &[],
            &proxy,
        )
        .unwrap();
        assert_eq!(call.args[0].to_json(), json!({"__remote_fn": ""}));
        assert_eq!(call.args[1].to_json(), json!({"__blob": 0}));
    }
}
