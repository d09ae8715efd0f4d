//! Per-connection JSON-RPC routing bound to one backend.
//!
//! A router serves exactly one client connection: it reads one
//! newline-framed JSON object at a time, validates it, dispatches on the
//! method, consults the access filter and interceptors, forwards to the
//! bound backend, and writes the (revalidated) response back. Requests on
//! a connection are strictly serial; the next line is not read until the
//! previous response has been written.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::filter::AccessFilter;
use crate::intercept::InterceptorSet;
use crate::jsonrpc;
use crate::proxy::ProxyCore;

/// Everything the router needs to know about its backend for one message:
/// the live handle (if any), the access filter, and the hook stages.
pub(crate) struct RouteTarget {
    pub backend: Option<Arc<dyn Backend>>,
    pub filter: AccessFilter,
    pub interceptors: InterceptorSet,
}

/// Serve one client connection until the client closes it, breaks the
/// framing, or the proxy shuts down. The target is re-resolved per message
/// so backend restarts are picked up without reconnecting.
pub(crate) async fn serve_connection(
    core: Arc<ProxyCore>,
    backend_name: String,
    stream: UnixStream,
    cancel: CancellationToken,
) {
    let max_line = core.settings().max_message_bytes;
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, LinesCodec::new_with_max_length(max_line));
    let mut writer = FramedWrite::new(write, LinesCodec::new());

    loop {
        // Requests on one connection are strictly serial; shutdown is only
        // observed between messages, never mid-request.
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = reader.next() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let line = match item {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(backend = %backend_name, "oversized client message, closing connection");
                break;
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(backend = %backend_name, error = %e, "connection read failed");
                break;
            }
        };

        let msg: Value = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(backend = %backend_name, error = %e, "invalid JSON from client, closing connection");
                break;
            }
        };

        let target = core.route_target(&backend_name).await;
        let Some(response) = dispatch(&backend_name, &target, msg).await else {
            continue;
        };

        let text = match serde_json::to_string(&response) {
            Ok(text) => text,
            Err(e) => {
                error!(backend = %backend_name, error = %e, "failed to serialize response");
                break;
            }
        };
        if let Err(e) = writer.send(text).await {
            debug!(backend = %backend_name, error = %e, "connection write failed");
            break;
        }
    }

    debug!(backend = %backend_name, "client disconnected");
}

/// Route one validated-or-rejected message. `None` means nothing is
/// written back (notifications, and malformed notifications).
pub(crate) async fn dispatch(backend_name: &str, target: &RouteTarget, msg: Value) -> Option<Value> {
    if !jsonrpc::is_valid_message(&msg) {
        return match jsonrpc::request_id(&msg) {
            Some(id) => Some(jsonrpc::error_response(
                id,
                jsonrpc::INVALID_REQUEST,
                "Invalid Request",
            )),
            None => {
                debug!(backend = %backend_name, "dropping malformed notification");
                None
            }
        };
    }

    let id = jsonrpc::request_id(&msg).cloned();
    let method = msg
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match (method.as_deref(), id) {
        (Some("initialize"), Some(id)) => Some(initialize(backend_name, target, &msg, &id).await),
        (Some("tools/list"), Some(id)) => Some(tools_list(backend_name, target, &msg, &id).await),
        (Some("tools/call"), id) => tools_call(backend_name, target, msg, id).await,
        // Anything else with an id is forwarded verbatim.
        (_, Some(id)) => Some(forward_verbatim(backend_name, target, &msg, &id).await),
        // Notifications are forwarded verbatim and never answered.
        (_, None) => {
            forward_notification(backend_name, target, &msg).await;
            None
        }
    }
}

/// Forward `initialize`; a backend that cannot produce a valid reply is
/// answered with a synthesized default. The client always sees a
/// successful initialize, even when the backend could not answer.
async fn initialize(backend_name: &str, target: &RouteTarget, msg: &Value, id: &Value) -> Value {
    if let Some(backend) = &target.backend {
        match backend.forward(msg).await {
            Ok(Some(resp))
                if jsonrpc::is_valid_response(&resp)
                    && resp.get("id") == Some(id)
                    && resp.get("result").is_some() =>
            {
                return resp;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(backend = %backend_name, error = %e, "initialize forward failed");
            }
        }
    }

    warn!(backend = %backend_name, "synthesizing default initialize response");
    jsonrpc::default_initialize_response(id, backend_name)
}

/// Forward `tools/list` and strip every tool the filter denies. A backend
/// that does not answer yields an empty list.
async fn tools_list(backend_name: &str, target: &RouteTarget, msg: &Value, id: &Value) -> Value {
    let tools = match &target.backend {
        Some(backend) => match backend.forward(msg).await {
            Ok(Some(resp)) => resp
                .pointer("/result/tools")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(backend = %backend_name, error = %e, "tools/list forward failed");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let filtered: Vec<Value> = tools
        .into_iter()
        .filter(|tool| {
            tool.get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| target.filter.allows(name))
        })
        .collect();

    jsonrpc::result_response(id, json!({"tools": filtered}))
}

/// The full `tools/call` pipeline: filter, before hooks, forward, after
/// hooks, correlation guard. An id-less call runs the same gauntlet but is
/// never answered.
async fn tools_call(
    backend_name: &str,
    target: &RouteTarget,
    msg: Value,
    id: Option<Value>,
) -> Option<Value> {
    let Some(tool) = msg
        .pointer("/params/name")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        return id.map(|id| {
            jsonrpc::error_response(&id, jsonrpc::INVALID_PARAMS, "Missing tool name")
        });
    };

    if !target.filter.allows(&tool) {
        warn!(backend = %backend_name, tool = %tool, "tool call denied by access filter");
        return id.map(|id| {
            jsonrpc::error_response(
                &id,
                jsonrpc::ACCESS_DENIED,
                format!("Tool {tool} not allowed"),
            )
        });
    }

    let Some(request) = target.interceptors.run_before(msg, backend_name, &tool) else {
        return id.map(|id| {
            jsonrpc::error_response(
                &id,
                jsonrpc::ACCESS_DENIED,
                "Tool call blocked by interceptor",
            )
        });
    };

    let Some(backend) = &target.backend else {
        return id.map(|id| {
            jsonrpc::error_response(
                &id,
                jsonrpc::BACKEND_UNAVAILABLE,
                format!("Backend {backend_name} is not running"),
            )
        });
    };

    let response = match backend.forward(&request).await {
        Ok(Some(resp)) => resp,
        // Notification delivered; nothing to return.
        Ok(None) => return None,
        Err(e) => {
            warn!(backend = %backend_name, tool = %tool, error = %e, "tools/call forward failed");
            return id.map(|id| jsonrpc::error_response(&id, e.jsonrpc_code(), e.to_string()));
        }
    };
    let id = id?;

    let Some(rewritten) = target
        .interceptors
        .run_after(&request, response, backend_name, &tool)
    else {
        return Some(jsonrpc::error_response(
            &id,
            jsonrpc::ACCESS_DENIED,
            "Response blocked by interceptor",
        ));
    };

    Some(correlate(backend_name, &id, rewritten))
}

async fn forward_verbatim(
    backend_name: &str,
    target: &RouteTarget,
    msg: &Value,
    id: &Value,
) -> Value {
    let Some(backend) = &target.backend else {
        return jsonrpc::error_response(
            id,
            jsonrpc::BACKEND_UNAVAILABLE,
            format!("Backend {backend_name} is not running"),
        );
    };

    match backend.forward(msg).await {
        Ok(Some(resp)) => correlate(backend_name, id, resp),
        Ok(None) => jsonrpc::error_response(
            id,
            jsonrpc::BACKEND_UNAVAILABLE,
            "No response from backend",
        ),
        Err(e) => jsonrpc::error_response(id, e.jsonrpc_code(), e.to_string()),
    }
}

async fn forward_notification(backend_name: &str, target: &RouteTarget, msg: &Value) {
    let Some(backend) = &target.backend else {
        debug!(backend = %backend_name, "dropping notification: backend not running");
        return;
    };
    if let Err(e) = backend.forward(msg).await {
        debug!(backend = %backend_name, error = %e, "notification forward failed");
    }
}

/// Correlation guard: everything written to a client must be a valid
/// response carrying the request's id. Anything else collapses to an
/// internal error with the right id.
fn correlate(backend_name: &str, id: &Value, response: Value) -> Value {
    if jsonrpc::is_valid_response(&response) && response.get("id") == Some(id) {
        response
    } else {
        error!(backend = %backend_name, "response failed correlation guard");
        jsonrpc::error_response(id, jsonrpc::INTERNAL_ERROR, "Internal error")
    }
}
