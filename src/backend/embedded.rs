//! In-process MCP backend.
//!
//! Tools are registered explicitly as (name, description, schema, handler)
//! entries; `forward` dispatches the three MCP methods directly to them
//! with no child process involved. Handlers are synchronous closures
//! returning the `result` payload of the response.

use std::sync::atomic::AtomicU8;
use std::sync::{Arc, RwLock};

use serde_json::{Value, json};
use tracing::debug;

use super::{Backend, BackendStatus, STATE_RUNNING, state_from_atomic, store_state};
use crate::error::BackendError;
use crate::jsonrpc;

/// Tool-level failure code reported by embedded backends (distinct from
/// the transport-level codes the router synthesizes).
const TOOL_EXECUTION_FAILED: i64 = -32000;

/// Handler for one embedded tool: takes the call's `arguments` object and
/// returns the response's `result` payload.
pub type ToolHandler = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

/// One registered embedded tool.
#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    handler: ToolHandler,
}

impl ToolDef {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(handler),
        }
    }
}

/// The ordered tool collection backing one embedded backend.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<ToolDef>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(mut self, def: ToolDef) -> Self {
        self.tools.push(def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool descriptors in MCP `tools/list` shape, registration order.
    pub fn descriptors(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|t| &t.name))
            .finish()
    }
}

/// Wrap plain text in MCP tool-result content.
pub fn text_content(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

/// An embedded backend: a live handle to a ToolSet. "Running" simply means
/// the handler is present; close() drops it.
pub struct EmbeddedBackend {
    name: String,
    state: AtomicU8,
    tools: RwLock<Option<Arc<ToolSet>>>,
}

impl EmbeddedBackend {
    pub fn new(name: impl Into<String>, tools: Arc<ToolSet>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(STATE_RUNNING),
            tools: RwLock::new(Some(tools)),
        }
    }

    fn tools(&self) -> Option<Arc<ToolSet>> {
        self.tools.read().ok().and_then(|g| g.clone())
    }

    fn handle_initialize(&self, id: &Value) -> Value {
        jsonrpc::result_response(
            id,
            json!({
                "protocolVersion": jsonrpc::PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": self.name, "version": env!("CARGO_PKG_VERSION") },
            }),
        )
    }

    fn handle_tools_call(&self, id: &Value, params: &Value, tools: &ToolSet) -> Value {
        let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
            return jsonrpc::error_response(id, jsonrpc::INVALID_PARAMS, "Missing tool name");
        };
        let Some(tool) = tools.get(tool_name) else {
            return jsonrpc::error_response(
                id,
                TOOL_EXECUTION_FAILED,
                format!("unknown tool '{tool_name}'"),
            );
        };

        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        debug!(backend = %self.name, tool = %tool_name, "calling embedded tool");

        match (tool.handler)(arguments) {
            Ok(result) => jsonrpc::result_response(id, result),
            Err(e) => jsonrpc::error_response(
                id,
                TOOL_EXECUTION_FAILED,
                format!("tool '{tool_name}' failed: {e}"),
            ),
        }
    }
}

#[async_trait::async_trait]
impl Backend for EmbeddedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self, msg: &Value) -> Result<Option<Value>, BackendError> {
        let tools = self.tools().ok_or_else(|| BackendError::NotRunning {
            backend: self.name.clone(),
        })?;

        // Notifications are delivered but never answered.
        let Some(id) = msg.get("id") else {
            return Ok(None);
        };

        let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

        let response = match method {
            "initialize" => self.handle_initialize(id),
            "tools/list" => jsonrpc::result_response(id, json!({"tools": tools.descriptors()})),
            "tools/call" => self.handle_tools_call(id, &params, &tools),
            other => jsonrpc::error_response(
                id,
                jsonrpc::METHOD_NOT_FOUND,
                format!("Unknown method: {other}"),
            ),
        };

        Ok(Some(response))
    }

    fn alive(&self) -> bool {
        self.state() == BackendStatus::Running && self.tools().is_some()
    }

    fn state(&self) -> BackendStatus {
        state_from_atomic(&self.state)
    }

    async fn close(&self) {
        store_state(&self.state, BackendStatus::Exited);
        if let Ok(mut guard) = self.tools.write() {
            guard.take();
        }
    }
}
