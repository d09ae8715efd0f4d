//! Per-backend before/after interceptor pipeline for `tools/call`.
//!
//! Hooks are plain closures registered per tool name, with `*` as a
//! wildcard that runs after the specific-tool hook. Hooks must not carry
//! mutable state; anything stateful belongs in data captured behind its
//! own synchronization.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{error, warn};

/// Key under which a hook applies to every tool on the backend.
pub const WILDCARD: &str = "*";

/// Before hook: `(request, backend, tool) -> Ok(Some(request'))` to let the
/// (possibly rewritten) call proceed, `Ok(None)` to block it. An `Err` is
/// logged and treated as a block.
pub type BeforeHook = Arc<dyn Fn(Value, &str, &str) -> Result<Option<Value>> + Send + Sync>;

/// After hook: `(request, response, backend, tool) -> Ok(Some(response'))`
/// to pass the (possibly rewritten) response on, `Ok(None)` to block it.
pub type AfterHook = Arc<dyn Fn(&Value, Value, &str, &str) -> Result<Option<Value>> + Send + Sync>;

/// The two ordered hook stages for one backend. Always present on a
/// backend config, possibly empty.
#[derive(Clone, Default)]
pub struct InterceptorSet {
    before: HashMap<String, BeforeHook>,
    after: HashMap<String, AfterHook>,
}

impl InterceptorSet {
    pub fn set_before(&mut self, tool: impl Into<String>, hook: BeforeHook) {
        self.before.insert(tool.into(), hook);
    }

    pub fn set_after(&mut self, tool: impl Into<String>, hook: AfterHook) {
        self.after.insert(tool.into(), hook);
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    /// Run the before stage: the specific-tool hook first, then the
    /// wildcard hook on its output. Returns `None` as soon as either hook
    /// blocks; the wildcard hook is not consulted after a block.
    pub fn run_before(&self, request: Value, backend: &str, tool: &str) -> Option<Value> {
        let mut current = request;

        for key in [tool, WILDCARD] {
            let Some(hook) = self.before.get(key) else {
                continue;
            };
            match hook(current, backend, tool) {
                Ok(Some(rewritten)) => current = rewritten,
                Ok(None) => {
                    warn!(backend, tool, hook = key, "before interceptor blocked tool call");
                    return None;
                }
                Err(e) => {
                    error!(backend, tool, hook = key, error = %e, "before interceptor failed");
                    return None;
                }
            }
        }

        Some(current)
    }

    /// Run the after stage over the backend's response, same ordering and
    /// block semantics as the before stage.
    pub fn run_after(
        &self,
        request: &Value,
        response: Value,
        backend: &str,
        tool: &str,
    ) -> Option<Value> {
        let mut current = response;

        for key in [tool, WILDCARD] {
            let Some(hook) = self.after.get(key) else {
                continue;
            };
            match hook(request, current, backend, tool) {
                Ok(Some(rewritten)) => current = rewritten,
                Ok(None) => {
                    warn!(backend, tool, hook = key, "after interceptor blocked response");
                    return None;
                }
                Err(e) => {
                    error!(backend, tool, hook = key, error = %e, "after interceptor failed");
                    return None;
                }
            }
        }

        Some(current)
    }
}

impl std::fmt::Debug for InterceptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorSet")
            .field("before", &self.before.keys().collect::<Vec<_>>())
            .field("after", &self.after.keys().collect::<Vec<_>>())
            .finish()
    }
}
