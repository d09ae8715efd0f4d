//! JSON-RPC 2.0 structural validation and response synthesis.
//!
//! The proxy never interprets tool payloads; it only checks that messages
//! have the shape the protocol requires and that response ids line up with
//! request ids. Everything here operates on raw `serde_json::Value` objects.

use serde_json::{Value, json};

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Tool denied by the access filter or blocked by an interceptor.
pub const ACCESS_DENIED: i64 = -32001;
/// Backend communication failure: timeout, no response, write error.
pub const BACKEND_UNAVAILABLE: i64 = -32003;

/// Protocol version advertised when the proxy has to synthesize an
/// `initialize` reply itself.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A structurally valid JSON-RPC 2.0 message: `jsonrpc == "2.0"` and either
/// a request (`method`, no `result`/`error`) or a response (exactly one of
/// `result`/`error`).
pub fn is_valid_message(msg: &Value) -> bool {
    let Some(obj) = msg.as_object() else {
        return false;
    };
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return false;
    }

    let has_method = obj.contains_key("method");
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if has_method {
        !has_result && !has_error
    } else {
        has_result != has_error
    }
}

/// A structurally valid JSON-RPC 2.0 response: version, an `id`, and
/// exactly one of `result`/`error`.
pub fn is_valid_response(msg: &Value) -> bool {
    let Some(obj) = msg.as_object() else {
        return false;
    };
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return false;
    }
    if !obj.contains_key("id") {
        return false;
    }
    obj.contains_key("result") != obj.contains_key("error")
}

/// A request without an `id` is a notification and must never be answered.
pub fn is_notification(msg: &Value) -> bool {
    msg.get("method").is_some() && msg.get("id").is_none()
}

/// The request's `id`, if any. Presence of the key is what matters; a
/// literal `null` id still marks the message as expecting a response.
pub fn request_id(msg: &Value) -> Option<&Value> {
    msg.as_object().and_then(|o| o.get("id"))
}

/// Build an error response echoing the given request id.
pub fn error_response(id: &Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

/// Build a success response echoing the given request id.
pub fn result_response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Default `initialize` result used when a backend fails to produce a valid
/// reply of its own: current protocol version, empty capabilities, and the
/// backend's name as serverInfo.
pub fn default_initialize_response(id: &Value, server_name: &str) -> Value {
    result_response(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": server_name, "version": env!("CARGO_PKG_VERSION") },
        }),
    )
}
