//! Negotiation payloads carried inside signal envelopes.
//!
//! The payload has no discriminant on the wire: a session description is
//! recognised by its `sdp`/`type` fields and a candidate by its `candidate`
//! object, in that order.

use crate::transport::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a link asks to be relayed to its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    /// An offer or answer.
    Description(SessionDescription),
    /// A network candidate.
    Candidate { candidate: IceCandidate },
}

impl SignalPayload {
    /// Infer the payload kind from a relayed JSON value.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> Value {
        // Both variants are plain structs of strings and integers.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SdpType;
    use serde_json::json;

    #[test]
    fn test_infer_offer() {
        let payload = SignalPayload::from_value(&json!({"type": "offer", "sdp": "v=0"})).unwrap();
        match payload {
            SignalPayload::Description(desc) => {
                assert_eq!(desc.kind, SdpType::Offer);
                assert_eq!(desc.sdp, "v=0");
            }
            other => panic!("Expected description, got {other:?}"),
        }
    }

    #[test]
    fn test_infer_candidate() {
        let payload = SignalPayload::from_value(&json!({
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        match payload {
            SignalPayload::Candidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("Expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_unrecognised_payload() {
        assert!(SignalPayload::from_value(&json!({"hello": "world"})).is_err());
        assert!(SignalPayload::from_value(&json!("offer")).is_err());
    }

    #[test]
    fn test_description_wire_shape_has_no_tag() {
        let value = SignalPayload::Description(SessionDescription::answer("v=1")).to_value();
        assert_eq!(value, json!({"type": "answer", "sdp": "v=1"}));
    }
}
