//! Gateway WebSocket protocol types (frames, connect handshake, hello-ok).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Oldest protocol revision this client can speak.
pub const MIN_PROTOCOL: u32 = 3;
/// Newest protocol revision this client can speak.
pub const MAX_PROTOCOL: u32 = 3;

/// Method name of the authentication handshake.
pub const CONNECT_METHOD: &str = "connect";

/// One discrete message on the transport.
///
/// Encoded with the discriminator in `type` (`"req"`, `"res"`, `"event"`). Decoding also
/// accepts it under `kind`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Wire event: `{ "type": "event", "event", "payload"?, "seq"? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Structured server error carried by a rejected response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Older gateways send `error` as a bare string.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireError {
    Structured(ErrorShape),
    Message(String),
}

impl From<WireError> for ErrorShape {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Structured(shape) => shape,
            WireError::Message(message) => ErrorShape::new("UNAVAILABLE", message),
        }
    }
}

/// Flat view of any frame, used only for decoding.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type", alias = "kind")]
    typ: String,
    id: Option<String>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    ok: Option<bool>,
    payload: Option<Value>,
    error: Option<WireError>,
    event: Option<String>,
    seq: Option<u64>,
}

/// Why an inbound text message could not be turned into a [`Frame`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("{typ} frame missing field {field}")]
    MissingField { typ: &'static str, field: &'static str },
}

impl Frame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Frame::Request(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Frame::Response(ResponseFrame {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        })
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Frame::Response(ResponseFrame {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        })
    }

    pub fn event(event: impl Into<String>, payload: Option<Value>, seq: Option<u64>) -> Self {
        Frame::Event(EventFrame {
            event: event.into(),
            payload,
            seq,
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        match raw.typ.as_str() {
            "req" => Ok(Frame::Request(RequestFrame {
                id: raw.id.ok_or(DecodeError::MissingField { typ: "req", field: "id" })?,
                method: raw
                    .method
                    .ok_or(DecodeError::MissingField { typ: "req", field: "method" })?,
                params: raw.params,
            })),
            "res" => Ok(Frame::Response(ResponseFrame {
                id: raw.id.ok_or(DecodeError::MissingField { typ: "res", field: "id" })?,
                ok: raw.ok.unwrap_or(false),
                payload: raw.payload,
                error: raw.error.map(ErrorShape::from),
            })),
            "event" => Ok(Frame::Event(EventFrame {
                event: raw
                    .event
                    .ok_or(DecodeError::MissingField { typ: "event", field: "event" })?,
                payload: raw.payload,
                seq: raw.seq,
            })),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

/// Client connect params (`connect` handshake).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    pub auth: ConnectAuth,
}

/// Client identity descriptor sent with connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            id: "companion".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "ui".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: String,
}

/// Server hello-ok payload after successful connect. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<HelloServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloServer {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub conn_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    #[serde(default)]
    pub tick_interval_ms: Option<u64>,
}

/// Auth grant returned in hello-ok (role and scopes, optionally a device token).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_encodes_with_type_tag() {
        let frame = Frame::request("r1", "health", json!({}));
        let v: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "req", "id": "r1", "method": "health", "params": {}}));
    }

    #[test]
    fn decode_accepts_kind_discriminator() {
        let frame = Frame::decode(r#"{"kind":"event","event":"tick","seq":4}"#).unwrap();
        assert_eq!(frame, Frame::event("tick", None, Some(4)));
    }

    #[test]
    fn decode_structured_error() {
        let frame = Frame::decode(
            r#"{"type":"res","id":"a","ok":false,"error":{"code":"INVALID_REQUEST","message":"bad","details":{"field":"x"}}}"#,
        )
        .unwrap();
        let Frame::Response(res) = frame else { panic!("expected response") };
        let err = res.error.unwrap();
        assert_eq!(err.code, "INVALID_REQUEST");
        assert_eq!(err.message, "bad");
        assert_eq!(err.details, Some(json!({"field": "x"})));
    }

    #[test]
    fn decode_string_error_from_older_gateway() {
        let frame = Frame::decode(r#"{"type":"res","id":"a","ok":false,"error":"unauthorized"}"#).unwrap();
        let Frame::Response(res) = frame else { panic!("expected response") };
        assert_eq!(res.error, Some(ErrorShape::new("UNAVAILABLE", "unauthorized")));
    }

    #[test]
    fn decode_rejects_unknown_type_and_missing_fields() {
        assert!(matches!(
            Frame::decode(r#"{"type":"ping"}"#),
            Err(DecodeError::UnknownType(t)) if t == "ping"
        ));
        assert!(matches!(
            Frame::decode(r#"{"type":"res","ok":true}"#),
            Err(DecodeError::MissingField { field: "id", .. })
        ));
        assert!(matches!(Frame::decode("not json"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn connect_params_use_camel_case() {
        let params = ConnectParams {
            min_protocol: MIN_PROTOCOL,
            max_protocol: MAX_PROTOCOL,
            client: ClientInfo {
                id: "companion".into(),
                version: "1.0.0".into(),
                platform: "linux".into(),
                mode: "ui".into(),
            },
            role: "operator".into(),
            scopes: vec![],
            auth: ConnectAuth { token: "t".into() },
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["minProtocol"], json!(MIN_PROTOCOL));
        assert_eq!(v["maxProtocol"], json!(MAX_PROTOCOL));
        assert_eq!(v["auth"], json!({"token": "t"}));
        assert!(v.get("scopes").is_none());
    }

    #[test]
    fn hello_ok_ignores_unknown_fields() {
        let hello: HelloOk = serde_json::from_value(json!({
            "type": "hello-ok",
            "protocol": 3,
            "features": {"methods": ["health"]},
            "policy": {"tickIntervalMs": 15000}
        }))
        .unwrap();
        assert_eq!(hello.protocol, Some(3));
        assert_eq!(hello.policy.and_then(|p| p.tick_interval_ms), Some(15000));
    }
}
