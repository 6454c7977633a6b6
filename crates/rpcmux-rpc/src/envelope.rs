use rpcmux_mux::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::serialized_error::SerializedError;

/// Request id, unique among outstanding calls on one channel.
pub type RequestId = u64;

/// One RPC message on an open channel.
///
/// JSON form is internally tagged:
/// `{"type":"call","id":1,"name":"svc#method","args":[...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Call {
        id: RequestId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Result {
        id: RequestId,
        #[serde(default)]
        result: Value,
    },
    Error {
        id: RequestId,
        error: SerializedError,
    },
    Cancel {
        id: RequestId,
    },
}

impl Envelope {
    pub fn id(&self) -> RequestId {
        match self {
            Envelope::Call { id, .. }
            | Envelope::Result { id, .. }
            | Envelope::Error { id, .. }
            | Envelope::Cancel { id } => *id,
        }
    }

    /// Encode as a text channel payload.
    pub fn to_payload(&self) -> Result<Payload> {
        Ok(Payload::Text(serde_json::to_string(self)?))
    }

    /// Decode from a text or binary channel payload.
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        Ok(match payload {
            Payload::Text(text) => serde_json::from_str(text)?,
            Payload::Binary(bytes) => serde_json::from_slice(bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::error::RpcError;

    #[test]
    fn call_wire_shape() {
        let envelope = Envelope::Call {
            id: 7,
            name: "CommonServerPath#getBackendOS".to_string(),
            args: vec![],
        };
        let Payload::Text(text) = envelope.to_payload().unwrap() else {
            panic!("envelopes are sent as text");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "call", "id": 7, "name": "CommonServerPath#getBackendOS", "args": []})
        );
    }

    #[test]
    fn binary_payloads_are_accepted() {
        let bytes = Bytes::from_static(br#"{"type":"result","id":3,"result":"Windows"}"#);
        let envelope = Envelope::from_payload(&Payload::Binary(bytes)).unwrap();
        assert_eq!(
            envelope,
            Envelope::Result {
                id: 3,
                result: json!("Windows")
            }
        );
    }

    #[test]
    fn missing_result_is_null() {
        let envelope =
            Envelope::from_payload(&Payload::from(r#"{"type":"result","id":1}"#)).unwrap();
        assert_eq!(
            envelope,
            Envelope::Result {
                id: 1,
                result: Value::Null
            }
        );
    }

    #[test]
    fn error_and_cancel_roundtrip() {
        for envelope in [
            Envelope::Error {
                id: 9,
                error: SerializedError::new("MethodNotFound", "svc#nope"),
            },
            Envelope::Cancel { id: 9 },
        ] {
            let payload = envelope.to_payload().unwrap();
            assert_eq!(Envelope::from_payload(&payload).unwrap(), envelope);
            assert_eq!(envelope.id(), 9);
        }
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(matches!(
            Envelope::from_payload(&Payload::from(r#"{"type":"shout","id":1}"#)),
            Err(RpcError::Codec(_))
        ));
    }
}
