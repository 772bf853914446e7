//! JSON-RPC frame types for both sides of the relay
//!
//! Downstream subscribers and upstream sources speak the same dialect:
//! `<ns>.objects.subscribe`, `<ns>.objects.query` and `notify_status_update`
//! push frames.

use crate::error::{RelayError, Result};
use crate::state::Mapping;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of push notifications
pub const NOTIFY_STATUS_UPDATE: &str = "notify_status_update";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// What an inbound request asks for, by method suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Subscribe,
    Unsubscribe,
    Query,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl Request {
    pub fn subscribe(namespace: &str, objects: &Value, id: u64) -> Self {
        Self::objects_request(namespace, "subscribe", objects, id)
    }

    pub fn query(namespace: &str, objects: &Value, id: u64) -> Self {
        Self::objects_request(namespace, "query", objects, id)
    }

    fn objects_request(namespace: &str, verb: &str, objects: &Value, id: u64) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: format!("{}.objects.{}", namespace, verb),
            params: json!({ "objects": objects }),
            id: json!(id),
        }
    }

    /// The `params.objects` spec, or an empty mapping when missing
    pub fn objects(&self) -> Value {
        self.params
            .get("objects")
            .cloned()
            .unwrap_or_else(|| Value::Object(Mapping::new()))
    }

    pub fn kind(&self) -> MethodKind {
        // "unsubscribe" also ends with "subscribe"
        if self.method.ends_with("unsubscribe") {
            MethodKind::Unsubscribe
        } else if self.method.ends_with("subscribe") {
            MethodKind::Subscribe
        } else if self.method.ends_with("query") {
            MethodKind::Query
        } else {
            MethodKind::Other
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }

    /// Query reply: `{"result": {"status": values}}`
    pub fn status(id: Value, values: Mapping) -> Self {
        Self::ok(id, json!({ "status": values }))
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::error(Value::Null, PARSE_ERROR, message)
    }
}

/// Push frame: `params` is `[values, timestamp]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: (Mapping, f64),
    pub id: Value,
}

impl Notification {
    pub fn status_update(subscription_id: Value, values: Mapping) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: NOTIFY_STATUS_UPDATE.to_string(),
            params: (values, now_seconds()),
            id: subscription_id,
        }
    }

    pub fn values(&self) -> &Mapping {
        &self.params.0
    }
}

/// Anything the relay writes to a downstream connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Response(Response),
    Notification(Notification),
}

impl OutboundFrame {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Response> for OutboundFrame {
    fn from(r: Response) -> Self {
        OutboundFrame::Response(r)
    }
}

impl From<Notification> for OutboundFrame {
    fn from(n: Notification) -> Self {
        OutboundFrame::Notification(n)
    }
}

/// Classified frame received from an upstream source
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    /// Push update, `params[0]`
    StatusUpdate(Mapping),
    /// Reply carrying `result.status` (query or subscribe reply)
    QueryResult(Mapping),
    Other,
}

/// Classify a raw upstream frame by shape.
///
/// Dotted keys are unfolded into nested mappings so that another relay can
/// serve as an upstream source.
pub fn classify_upstream(text: &str) -> Result<UpstreamFrame> {
    let frame: Value = serde_json::from_str(text)?;
    let frame = frame
        .as_object()
        .ok_or_else(|| RelayError::ProtocolDecode("frame is not an object".to_string()))?;

    if let Some(method) = frame.get("method").and_then(Value::as_str) {
        if !method.ends_with("status_update") {
            return Ok(UpstreamFrame::Other);
        }
        return match frame.get("params").and_then(|p| p.get(0)) {
            Some(Value::Object(values)) => Ok(UpstreamFrame::StatusUpdate(unfold_dotted(values))),
            _ => Err(RelayError::ProtocolDecode(format!(
                "{} without a values mapping",
                method
            ))),
        };
    }

    match frame.get("result").and_then(|r| r.get("status")) {
        Some(Value::Object(status)) => Ok(UpstreamFrame::QueryResult(unfold_dotted(status))),
        _ => Ok(UpstreamFrame::Other),
    }
}

/// Turn `{"a.b": 1}` into `{"a": {"b": 1}}`, deep-merging siblings
pub fn unfold_dotted(values: &Mapping) -> Mapping {
    let mut out = Mapping::new();
    for (key, value) in values {
        let value = match value {
            Value::Object(nested) => Value::Object(unfold_dotted(nested)),
            other => other.clone(),
        };
        let mut segments: Vec<&str> = key.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            segments = vec![key.as_str()];
        }
        insert_nested(&mut out, &segments, value);
    }
    out
}

fn insert_nested(target: &mut Mapping, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        match (target.get_mut(*first), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    insert_nested(existing, &[k.as_str()], v);
                }
            }
            (_, value) => {
                target.insert(first.to_string(), value);
            }
        }
        return;
    }
    let slot = target
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Mapping::new()));
    if !slot.is_object() {
        *slot = Value::Object(Mapping::new());
    }
    if let Value::Object(child) = slot {
        insert_nested(child, rest, value);
    }
}

/// Wall clock in seconds as a float, the notification timestamp format
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
