pub mod embedded;
pub mod external;

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;

// Shared state constants used by both backend kinds.
pub(crate) const STATE_REGISTERED: u8 = 0;
pub(crate) const STATE_STARTING: u8 = 1;
pub(crate) const STATE_RUNNING: u8 = 2;
pub(crate) const STATE_EXITED: u8 = 3;
pub(crate) const STATE_FAILED: u8 = 4;

/// Lifecycle state of a backend.
///
/// `Registered -> Starting -> Running -> (Exited | Failed)`. The Exited
/// transition is also taken lazily when `forward` finds the child's stdout
/// closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStatus {
    Registered,
    Starting,
    Running,
    Exited,
    Failed,
}

/// Read a BackendStatus from an AtomicU8.
pub(crate) fn state_from_atomic(state: &AtomicU8) -> BackendStatus {
    match state.load(Ordering::Acquire) {
        STATE_REGISTERED => BackendStatus::Registered,
        STATE_STARTING => BackendStatus::Starting,
        STATE_RUNNING => BackendStatus::Running,
        STATE_EXITED => BackendStatus::Exited,
        _ => BackendStatus::Failed,
    }
}

/// Store a BackendStatus into an AtomicU8.
pub(crate) fn store_state(atomic: &AtomicU8, state: BackendStatus) {
    let val = match state {
        BackendStatus::Registered => STATE_REGISTERED,
        BackendStatus::Starting => STATE_STARTING,
        BackendStatus::Running => STATE_RUNNING,
        BackendStatus::Exited => STATE_EXITED,
        BackendStatus::Failed => STATE_FAILED,
    };
    atomic.store(val, Ordering::Release);
}

/// One MCP server managed by the proxy, external child process or
/// in-process handler. The router never branches on which.
///
/// `forward` takes a validated JSON-RPC message. Notifications are
/// delivered and yield `Ok(None)`; requests yield the matching response,
/// which is guaranteed to satisfy the response schema and to echo the
/// request's `id`. Calls may arrive concurrently from many connections;
/// implementations serialize internally.
#[async_trait]
pub trait Backend: Send + Sync {
    #[allow(dead_code)]
    fn name(&self) -> &str;

    async fn forward(&self, msg: &Value) -> Result<Option<Value>, BackendError>;

    fn alive(&self) -> bool;

    fn state(&self) -> BackendStatus;

    /// Tear the backend down. Idempotent.
    async fn close(&self);
}
