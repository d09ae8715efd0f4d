//! Test utilities — a controllable mock backend.
//!
//! Only compiled under `#[cfg(test)]`. The mock implements the `Backend`
//! trait directly, so routers and the controller can be exercised without
//! child processes or sockets. Replies are scripted per call; the default
//! behavior echoes a response with the request's id and an empty result.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::AtomicU8;

use serde_json::{Value, json};

use crate::backend::{Backend, BackendStatus, STATE_RUNNING, state_from_atomic, store_state};
use crate::error::BackendError;

/// One scripted reply, consumed in FIFO order by `forward`.
pub enum Reply {
    /// Respond with this `result` payload, id taken from the request.
    Result(Value),
    /// Respond with exactly this message (for protocol-violation tests).
    Raw(Value),
    /// Fail as if the response read timed out.
    Timeout,
    /// Fail as if the child's stdout closed; flips the state to Exited.
    Closed,
}

/// A controllable mock MCP backend. Records every forwarded message so
/// tests can assert on what did (or did not) reach the backend.
pub struct MockBackend {
    name: String,
    state: AtomicU8,
    script: Mutex<VecDeque<Reply>>,
    forwarded: Mutex<Vec<Value>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: AtomicU8::new(STATE_RUNNING),
            script: Mutex::new(VecDeque::new()),
            forwarded: Mutex::new(Vec::new()),
        }
    }

    /// Queue a scripted reply for the next request.
    pub fn push_reply(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    /// Everything `forward` has received, in order.
    pub fn forwarded(&self) -> Vec<Value> {
        self.forwarded.lock().unwrap().clone()
    }

    /// Number of messages forwarded to this backend.
    pub fn forward_count(&self) -> usize {
        self.forwarded.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self, msg: &Value) -> Result<Option<Value>, BackendError> {
        self.forwarded.lock().unwrap().push(msg.clone());

        if msg.get("id").is_none() {
            return Ok(None);
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            None => Ok(Some(json!({
                "jsonrpc": "2.0",
                "id": msg["id"],
                "result": {},
            }))),
            Some(Reply::Result(result)) => Ok(Some(json!({
                "jsonrpc": "2.0",
                "id": msg["id"],
                "result": result,
            }))),
            Some(Reply::Raw(raw)) => Ok(Some(raw)),
            Some(Reply::Timeout) => Err(BackendError::Timeout {
                backend: self.name.clone(),
                timeout: std::time::Duration::from_secs(30),
            }),
            Some(Reply::Closed) => {
                store_state(&self.state, BackendStatus::Exited);
                Err(BackendError::ChannelClosed {
                    backend: self.name.clone(),
                })
            }
        }
    }

    fn alive(&self) -> bool {
        self.state() == BackendStatus::Running
    }

    fn state(&self) -> BackendStatus {
        state_from_atomic(&self.state)
    }

    async fn close(&self) {
        store_state(&self.state, BackendStatus::Exited);
    }
}
