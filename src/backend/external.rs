//! Child-process MCP backend speaking newline-delimited JSON-RPC over its
//! stdin/stdout.
//!
//! Correlation relies on the request/response pair being exchanged under a
//! single mutex: exactly one request is in flight per child at any time, so
//! the next stdout line is the answer to the line just written. No per-id
//! tracking is needed.

use std::process::Stdio;
use std::sync::atomic::AtomicU8;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Backend, BackendStatus, STATE_STARTING, state_from_atomic, store_state};
use crate::config::BackendConfig;
use crate::error::{BackendError, SpawnError};

/// How long to watch a freshly spawned child before declaring it started.
const SPAWN_GRACE: Duration = Duration::from_millis(250);

/// How long a terminated child gets to exit before being killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Most stderr kept from a child that died at startup.
const STDERR_CAPTURE_LIMIT: u64 = 8 * 1024;

#[derive(Debug)]
struct ChildIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// An external backend: one child process plus the single-writer lock that
/// serializes request/response pairs over its pipes.
#[derive(Debug)]
pub struct ExternalBackend {
    name: String,
    timeout: Duration,
    state: AtomicU8,
    io: Mutex<Option<ChildIo>>,
    child: Mutex<Option<Child>>,
}

impl ExternalBackend {
    /// Spawn the child with the computed environment and piped stdio, wait
    /// briefly, and fail with the child's stderr if it exited immediately.
    pub async fn start(config: &BackendConfig) -> Result<Self, SpawnError> {
        let name = config.name.clone();
        let program = config.command.as_deref().ok_or_else(|| SpawnError::Spawn {
            name: name.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "external backend requires a command",
            ),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(&config.args)
            .env_clear()
            .envs(config.build_child_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        // Each child in its own process group so stop() can signal the
        // whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            name: name.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(backend = %name, pid = ?pid, "spawned child process");

        // Wait briefly; a child that dies this fast is a config problem,
        // and its stderr is the only useful diagnostic.
        tokio::time::sleep(SPAWN_GRACE).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stderr = String::new();
                if let Some(pipe) = child.stderr.take() {
                    let _ = pipe
                        .take(STDERR_CAPTURE_LIMIT)
                        .read_to_string(&mut stderr)
                        .await;
                }
                let stderr = stderr.trim().to_string();
                let stderr = if stderr.is_empty() {
                    format!("exit status {status}")
                } else {
                    stderr
                };
                return Err(SpawnError::ExitedEarly { name, stderr });
            }
            Ok(None) => {}
            Err(source) => return Err(SpawnError::Spawn { name, source }),
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::MissingStdio { name: name.clone() })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::MissingStdio { name: name.clone() })?;

        // Drain stderr in the background so a chatty child never blocks on
        // a full pipe; lines surface in our logs at debug level.
        if let Some(pipe) = child.stderr.take() {
            let stderr_name = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(backend = %stderr_name, "stderr: {line}");
                }
            });
        }

        info!(backend = %name, pid = ?pid, "backend started");

        let backend = Self {
            name,
            timeout: config.timeout,
            state: AtomicU8::new(STATE_STARTING),
            io: Mutex::new(Some(ChildIo {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            })),
            child: Mutex::new(Some(child)),
        };
        store_state(&backend.state, BackendStatus::Running);
        Ok(backend)
    }

    fn io_error(&self, source: std::io::Error) -> BackendError {
        if source.kind() == std::io::ErrorKind::BrokenPipe {
            store_state(&self.state, BackendStatus::Exited);
            BackendError::ChannelClosed {
                backend: self.name.clone(),
            }
        } else {
            BackendError::Io {
                backend: self.name.clone(),
                source,
            }
        }
    }

    fn protocol_error(&self, reason: impl Into<String>) -> BackendError {
        BackendError::Protocol {
            backend: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for ExternalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self, msg: &Value) -> Result<Option<Value>, BackendError> {
        // Single-writer lock held across the whole request/response pair.
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(|| BackendError::NotRunning {
            backend: self.name.clone(),
        })?;

        let line = serde_json::to_string(msg)
            .map_err(|e| self.protocol_error(format!("unserializable message: {e}")))?;
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        io.stdin.write_all(b"\n").await.map_err(|e| self.io_error(e))?;
        io.stdin.flush().await.map_err(|e| self.io_error(e))?;

        // Notifications are one-way.
        let Some(request_id) = msg.get("id") else {
            return Ok(None);
        };

        let reply = match tokio::time::timeout(self.timeout, io.stdout.next_line()).await {
            Err(_) => {
                return Err(BackendError::Timeout {
                    backend: self.name.clone(),
                    timeout: self.timeout,
                });
            }
            Ok(Err(e)) => return Err(self.io_error(e)),
            Ok(Ok(None)) => {
                // Stdout closed: the child is gone. Detected lazily, here.
                store_state(&self.state, BackendStatus::Exited);
                warn!(backend = %self.name, "child stdout closed, marking backend exited");
                return Err(BackendError::ChannelClosed {
                    backend: self.name.clone(),
                });
            }
            Ok(Ok(Some(line))) => line,
        };

        let response: Value = serde_json::from_str(&reply)
            .map_err(|e| self.protocol_error(format!("unparseable response: {e}")))?;
        if !crate::jsonrpc::is_valid_response(&response) {
            return Err(self.protocol_error("not a JSON-RPC 2.0 response"));
        }
        if response.get("id") != Some(request_id) {
            return Err(self.protocol_error(format!(
                "response id {} does not match request id {}",
                response.get("id").unwrap_or(&Value::Null),
                request_id
            )));
        }

        Ok(Some(response))
    }

    fn alive(&self) -> bool {
        self.state() == BackendStatus::Running
    }

    fn state(&self) -> BackendStatus {
        state_from_atomic(&self.state)
    }

    async fn close(&self) {
        store_state(&self.state, BackendStatus::Exited);

        // Dropping the pipes closes the child's stdin; waits for any
        // in-flight forward to finish first.
        self.io.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        // Terminate the whole process group, then kill after the grace
        // period if it is still around.
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let pgid = nix::unistd::Pid::from_raw(-(pid as i32));
            if nix::sys::signal::kill(pgid, nix::sys::signal::Signal::SIGTERM).is_err() {
                warn!(backend = %self.name, pid, "failed to signal process group");
            }
        }

        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(backend = %self.name, exit = ?status.code(), "child exited");
            }
            Ok(Err(e)) => {
                warn!(backend = %self.name, error = %e, "error reaping child");
            }
            Err(_) => {
                warn!(backend = %self.name, "child ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }

        info!(backend = %self.name, "backend stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(name: &str, script: &str) -> BackendConfig {
        BackendConfig::external(name, "sh").args(["-c", script])
    }

    fn call(id: i64) -> Value {
        json!({
            "jsonrpc": "2.0", "id": id, "method": "tools/call",
            "params": {"name": "say", "arguments": {}},
        })
    }

    #[tokio::test]
    async fn responds_when_id_matches() {
        let script =
            r#"while read -r line; do printf '%s\n' '{"jsonrpc":"2.0","id":7,"result":{"ok":true}}'; done"#;
        let backend = ExternalBackend::start(&sh("fixed", script)).await.unwrap();
        assert!(backend.alive());

        let resp = backend.forward(&call(7)).await.unwrap().unwrap();
        assert_eq!(resp["result"]["ok"], json!(true));
        assert_eq!(resp["id"], json!(7));

        backend.close().await;
        assert!(!backend.alive());
    }

    #[tokio::test]
    async fn mismatched_response_id_is_a_protocol_error() {
        let script =
            r#"while read -r line; do printf '%s\n' '{"jsonrpc":"2.0","id":7,"result":{}}'; done"#;
        let backend = ExternalBackend::start(&sh("fixed", script)).await.unwrap();

        let err = backend.forward(&call(8)).await.unwrap_err();
        assert!(matches!(err, BackendError::Protocol { .. }));

        backend.close().await;
    }

    #[tokio::test]
    async fn non_response_payload_is_a_protocol_error() {
        // Echoes the request back: a valid message but not a response.
        let backend = ExternalBackend::start(&sh("echoer", "cat")).await.unwrap();

        let err = backend.forward(&call(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::Protocol { .. }));

        backend.close().await;
    }

    #[tokio::test]
    async fn notification_returns_nothing() {
        let backend = ExternalBackend::start(&sh("sink", "cat")).await.unwrap();

        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        assert!(backend.forward(&note).await.unwrap().is_none());

        backend.close().await;
    }

    #[tokio::test]
    async fn immediate_exit_reports_stderr() {
        let err = ExternalBackend::start(&sh("doomed", "echo boom >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            SpawnError::ExitedEarly { name, stderr } => {
                assert_eq!(name, "doomed");
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected ExitedEarly, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let config = BackendConfig::external("ghost", "/nonexistent/program-xyz");
        let err = ExternalBackend::start(&config).await.unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_backend_times_out_but_stays_running() {
        let config = sh("slow", "read x; sleep 30").timeout(Duration::from_millis(200));
        let backend = ExternalBackend::start(&config).await.unwrap();

        let err = backend.forward(&call(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
        // A slow backend is not killed.
        assert_eq!(backend.state(), BackendStatus::Running);

        backend.close().await;
    }

    #[tokio::test]
    async fn stdout_eof_marks_backend_exited() {
        // Consumes one line, then exits without answering.
        let backend = ExternalBackend::start(&sh("flaky", "read x")).await.unwrap();

        let err = backend.forward(&call(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::ChannelClosed { .. }));
        assert_eq!(backend.state(), BackendStatus::Exited);
        assert!(!backend.alive());

        backend.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let backend = ExternalBackend::start(&sh("twice", "cat")).await.unwrap();
        backend.close().await;
        backend.close().await;
        assert_eq!(backend.state(), BackendStatus::Exited);
    }
}
