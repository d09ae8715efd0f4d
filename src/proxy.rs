//! The proxy controller: backend registry, endpoint fabric lifecycle, and
//! status reporting.
//!
//! The controller owns everything with a lifetime: the registry, the
//! scratch directory holding the per-backend sockets, the accept workers,
//! and the backends themselves. `startup()` binds every endpoint before
//! starting any backend, so a client acting on a freshly generated config
//! always finds a listener.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backend::embedded::EmbeddedBackend;
use crate::backend::external::ExternalBackend;
use crate::backend::{Backend, BackendStatus};
use crate::config::{BackendConfig, ProxySettings};
use crate::endpoint;
use crate::error::ConfigError;
use crate::filter::AccessFilter;
use crate::intercept::InterceptorSet;
use crate::router::RouteTarget;

/// One registry slot: the declared config plus whatever runtime state the
/// backend currently has.
struct BackendEntry {
    config: BackendConfig,
    backend: Option<Arc<dyn Backend>>,
    /// Authoritative while no backend object exists (Registered, Starting,
    /// Failed, stopped); a live backend reports its own state.
    status: BackendStatus,
    endpoint_path: Option<PathBuf>,
}

impl BackendEntry {
    fn current_status(&self) -> BackendStatus {
        match &self.backend {
            Some(backend) => backend.state(),
            None => self.status,
        }
    }
}

/// Insertion-ordered backend registry.
#[derive(Default)]
struct Registry {
    entries: HashMap<String, BackendEntry>,
    order: Vec<String>,
}

/// Everything that only exists while the endpoint fabric is up.
struct EndpointRuntime {
    scratch: TempDir,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Shared controller state; routers and accept workers hold an `Arc` of
/// this.
pub(crate) struct ProxyCore {
    name: String,
    settings: ProxySettings,
    connections: Arc<Semaphore>,
    registry: RwLock<Registry>,
    runtime: Mutex<Option<EndpointRuntime>>,
}

impl ProxyCore {
    pub(crate) fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub(crate) fn connections(&self) -> &Arc<Semaphore> {
        &self.connections
    }

    /// Snapshot of what a router needs to serve one message for `name`.
    pub(crate) async fn route_target(&self, name: &str) -> RouteTarget {
        let registry = self.registry.read().await;
        match registry.entries.get(name) {
            Some(entry) => RouteTarget {
                backend: entry.backend.clone().filter(|b| b.alive()),
                filter: entry.config.filter.clone(),
                interceptors: entry.config.interceptors.clone(),
            },
            None => RouteTarget {
                backend: None,
                filter: AccessFilter::default(),
                interceptors: InterceptorSet::default(),
            },
        }
    }
}

/// The multiplexing proxy. See the crate root for the overall shape.
pub struct Proxy {
    core: Arc<ProxyCore>,
}

impl Proxy {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, ProxySettings::default())
    }

    pub fn with_settings(name: impl Into<String>, settings: ProxySettings) -> Self {
        let connections = Arc::new(Semaphore::new(settings.max_connections));
        Self {
            core: Arc::new(ProxyCore {
                name: name.into(),
                settings,
                connections,
                registry: RwLock::new(Registry::default()),
                runtime: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Add a backend to the registry. Fails on an invalid config or a name
    /// that is already taken.
    pub async fn register(&self, config: BackendConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut registry = self.core.registry.write().await;
        if registry.entries.contains_key(&config.name) {
            return Err(ConfigError::DuplicateName(config.name));
        }

        info!(backend = %config.name, kind = config.kind(), "registered backend");
        registry.order.push(config.name.clone());
        registry.entries.insert(
            config.name.clone(),
            BackendEntry {
                config,
                backend: None,
                status: BackendStatus::Registered,
                endpoint_path: None,
            },
        );
        Ok(())
    }

    /// Register every entry of a `{"mcpServers": {...}}` document. Bad
    /// entries are logged and skipped; returns how many were added.
    pub async fn load_registrations(&self, doc: &serde_json::Value) -> usize {
        let Some(servers) = doc.get("mcpServers").and_then(serde_json::Value::as_object) else {
            warn!("registration document has no mcpServers object");
            return 0;
        };

        let mut added = 0;
        for (name, spec) in servers {
            match BackendConfig::from_registration(name, spec) {
                Ok(config) => match self.register(config).await {
                    Ok(()) => added += 1,
                    Err(e) => error!(backend = %name, error = %e, "failed to register backend"),
                },
                Err(e) => error!(backend = %name, error = %e, "invalid backend registration"),
            }
        }
        added
    }

    /// Bring the endpoint fabric up and start the auto-start backends.
    /// Idempotent; a second call while running is a no-op.
    pub async fn startup(&self) -> Result<()> {
        let mut runtime_slot = self.core.runtime.lock().await;
        if runtime_slot.is_some() {
            debug!("startup called while already running");
            return Ok(());
        }

        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}_", self.core.name))
            .tempdir()
            .context("failed to create scratch directory")?;
        // The scratch directory is the only access control on the sockets.
        std::fs::set_permissions(scratch.path(), std::fs::Permissions::from_mode(0o700))
            .context("failed to restrict scratch directory permissions")?;

        // Bind every endpoint before starting any backend. A bind failure
        // here tears down by dropping: nothing has been spawned yet.
        let names: Vec<String> = self.core.registry.read().await.order.clone();
        let mut bound = Vec::new();
        for name in &names {
            let path = scratch.path().join(format!("{name}.sock"));
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove stale socket for '{name}'"))?;
            }
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind endpoint socket for '{name}'"))?;
            bound.push((name.clone(), path, listener));
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        {
            let mut registry = self.core.registry.write().await;
            for (name, path, listener) in bound {
                if let Some(entry) = registry.entries.get_mut(&name) {
                    entry.endpoint_path = Some(path.clone());
                }
                tracker.spawn(endpoint::accept_loop(
                    Arc::clone(&self.core),
                    name,
                    listener,
                    path,
                    cancel.child_token(),
                    tracker.clone(),
                ));
            }
        }

        info!(
            proxy = %self.core.name,
            endpoints = names.len(),
            scratch = %scratch.path().display(),
            "endpoint fabric up"
        );
        *runtime_slot = Some(EndpointRuntime {
            scratch,
            cancel,
            tracker,
        });
        drop(runtime_slot);

        // A backend that fails to start leaves the rest alone.
        for name in names {
            let auto_start = {
                let registry = self.core.registry.read().await;
                registry
                    .entries
                    .get(&name)
                    .is_some_and(|e| e.config.auto_start)
            };
            if auto_start && let Err(e) = self.start_backend(&name).await {
                error!(backend = %name, error = %e, "failed to start backend");
            }
        }

        Ok(())
    }

    /// Start one backend. Idempotent while the backend is alive.
    pub async fn start_backend(&self, name: &str) -> Result<()> {
        let config = {
            let mut registry = self.core.registry.write().await;
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| anyhow!("unknown backend '{name}'"))?;
            if entry.backend.as_ref().is_some_and(|b| b.alive()) {
                debug!(backend = %name, "backend already running");
                return Ok(());
            }
            entry.status = BackendStatus::Starting;
            entry.config.clone()
        };

        let started: Result<Arc<dyn Backend>> = if config.is_external() {
            ExternalBackend::start(&config)
                .await
                .map(|b| Arc::new(b) as Arc<dyn Backend>)
                .map_err(Into::into)
        } else {
            config
                .tools
                .clone()
                .map(|tools| Arc::new(EmbeddedBackend::new(config.name.clone(), tools)) as Arc<dyn Backend>)
                .ok_or_else(|| anyhow!("backend '{name}' has no embedded tool set"))
        };

        let mut registry = self.core.registry.write().await;
        let entry = registry
            .entries
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown backend '{name}'"))?;
        match started {
            Ok(backend) => {
                info!(backend = %name, kind = config.kind(), "backend running");
                entry.status = BackendStatus::Running;
                entry.backend = Some(backend);
                Ok(())
            }
            Err(e) => {
                entry.status = BackendStatus::Failed;
                Err(e.context(format!("failed to start backend '{name}'")))
            }
        }
    }

    /// Stop one backend: terminate, grace period, kill, reap. Idempotent.
    pub async fn stop_backend(&self, name: &str) -> Result<()> {
        let backend = {
            let mut registry = self.core.registry.write().await;
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| anyhow!("unknown backend '{name}'"))?;
            let backend = entry.backend.take();
            if backend.is_some() {
                entry.status = BackendStatus::Exited;
            }
            backend
        };

        if let Some(backend) = backend {
            backend.close().await;
        }
        Ok(())
    }

    /// Stop everything: backends, listeners, socket files, workers, the
    /// scratch directory. Safe to call twice and after a partial startup.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.core.registry.read().await.order.clone();
        for name in &names {
            if let Err(e) = self.stop_backend(name).await {
                warn!(backend = %name, error = %e, "error stopping backend");
            }
        }

        let Some(EndpointRuntime {
            scratch,
            cancel,
            tracker,
        }) = self.core.runtime.lock().await.take()
        else {
            return;
        };

        cancel.cancel();
        tracker.close();
        tracker.wait().await;

        // Accept workers unlink their own socket files; removing the
        // scratch directory sweeps whatever is left.
        if let Err(e) = scratch.close() {
            warn!(error = %e, "failed to remove scratch directory");
        }

        let mut registry = self.core.registry.write().await;
        for entry in registry.entries.values_mut() {
            entry.endpoint_path = None;
        }
        info!(proxy = %self.core.name, "proxy stopped");
    }

    /// Point-in-time view of the registry and fabric.
    pub async fn status(&self) -> ProxyStatus {
        let (running, scratch_dir) = {
            let runtime = self.core.runtime.lock().await;
            (
                runtime.is_some(),
                runtime.as_ref().map(|r| r.scratch.path().to_path_buf()),
            )
        };

        let registry = self.core.registry.read().await;
        let backends = registry
            .order
            .iter()
            .filter_map(|name| registry.entries.get(name))
            .map(|entry| BackendStatusEntry {
                name: entry.config.name.clone(),
                kind: entry.config.kind().to_string(),
                command: entry.config.command.clone(),
                status: entry.current_status(),
                alive: entry.backend.as_ref().is_some_and(|b| b.alive()),
                auto_start: entry.config.auto_start,
                endpoint_path: entry.endpoint_path.clone(),
                whitelist: sorted(&entry.config.filter.whitelist),
                blacklist: sorted(&entry.config.filter.blacklist),
            })
            .collect();

        ProxyStatus {
            name: self.core.name.clone(),
            running,
            scratch_dir,
            backends,
        }
    }

    /// The (backend name, endpoint path) pairs the client-config
    /// generators consume, in registration order. Empty before startup.
    pub async fn endpoints(&self) -> Vec<(String, PathBuf)> {
        let registry = self.core.registry.read().await;
        registry
            .order
            .iter()
            .filter_map(|name| {
                let entry = registry.entries.get(name)?;
                Some((name.clone(), entry.endpoint_path.clone()?))
            })
            .collect()
    }
}

fn sorted(set: &Option<std::collections::HashSet<String>>) -> Option<Vec<String>> {
    set.as_ref().map(|s| {
        let mut v: Vec<String> = s.iter().cloned().collect();
        v.sort();
        v
    })
}

/// Status snapshot for the whole proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub name: String,
    pub running: bool,
    pub scratch_dir: Option<PathBuf>,
    pub backends: Vec<BackendStatusEntry>,
}

/// Status snapshot for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatusEntry {
    pub name: String,
    pub kind: String,
    pub command: Option<String>,
    pub status: BackendStatus,
    pub alive: bool,
    pub auto_start: bool,
    pub endpoint_path: Option<PathBuf>,
    pub whitelist: Option<Vec<String>>,
    pub blacklist: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::embedded::{ToolDef, ToolSet, text_content};
    use serde_json::json;

    fn echo_tools() -> ToolSet {
        ToolSet::new().tool(ToolDef::new(
            "say",
            "Echo",
            json!({"type": "object"}),
            |args| {
                Ok(text_content(
                    args.get("msg").and_then(serde_json::Value::as_str).unwrap_or(""),
                ))
            },
        ))
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let proxy = Proxy::new("test");
        proxy
            .register(BackendConfig::embedded("echo", echo_tools()))
            .await
            .unwrap();
        let err = proxy
            .register(BackendConfig::embedded("echo", echo_tools()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn startup_binds_sockets_and_restricts_scratch() {
        let proxy = Proxy::new("test");
        proxy
            .register(BackendConfig::embedded("alpha", echo_tools()))
            .await
            .unwrap();
        proxy
            .register(BackendConfig::embedded("beta", echo_tools()))
            .await
            .unwrap();
        proxy.startup().await.unwrap();

        let endpoints = proxy.endpoints().await;
        assert_eq!(endpoints.len(), 2);
        // Registration order is preserved.
        assert_eq!(endpoints[0].0, "alpha");
        assert_eq!(endpoints[1].0, "beta");
        for (name, path) in &endpoints {
            assert!(path.exists(), "socket for {name} missing");
            assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("{name}.sock"));
        }

        let status = proxy.status().await;
        let scratch = status.scratch_dir.clone().unwrap();
        let mode = std::fs::metadata(&scratch).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        proxy.shutdown().await;
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn startup_is_idempotent() {
        let proxy = Proxy::new("test");
        proxy
            .register(BackendConfig::embedded("echo", echo_tools()))
            .await
            .unwrap();
        proxy.startup().await.unwrap();
        let first = proxy.endpoints().await;
        proxy.startup().await.unwrap();
        assert_eq!(proxy.endpoints().await, first);
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn auto_start_false_leaves_backend_registered() {
        let proxy = Proxy::new("test");
        proxy
            .register(BackendConfig::embedded("lazy", echo_tools()).auto_start(false))
            .await
            .unwrap();
        proxy.startup().await.unwrap();

        let status = proxy.status().await;
        assert_eq!(status.backends[0].status, BackendStatus::Registered);
        assert!(!status.backends[0].alive);
        // The endpoint exists even though the backend is not running.
        assert!(status.backends[0].endpoint_path.is_some());

        proxy.start_backend("lazy").await.unwrap();
        let status = proxy.status().await;
        assert_eq!(status.backends[0].status, BackendStatus::Running);

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn failed_spawn_marks_failed_and_startup_continues() {
        let proxy = Proxy::new("test");
        proxy
            .register(BackendConfig::external("broken", "/nonexistent/program-xyz"))
            .await
            .unwrap();
        proxy
            .register(BackendConfig::embedded("fine", echo_tools()))
            .await
            .unwrap();
        proxy.startup().await.unwrap();

        let status = proxy.status().await;
        let broken = status.backends.iter().find(|b| b.name == "broken").unwrap();
        let fine = status.backends.iter().find(|b| b.name == "fine").unwrap();
        assert_eq!(broken.status, BackendStatus::Failed);
        assert_eq!(fine.status, BackendStatus::Running);

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn stop_backend_is_idempotent() {
        let proxy = Proxy::new("test");
        proxy
            .register(BackendConfig::embedded("echo", echo_tools()))
            .await
            .unwrap();
        proxy.startup().await.unwrap();

        proxy.stop_backend("echo").await.unwrap();
        proxy.stop_backend("echo").await.unwrap();
        let status = proxy.status().await;
        assert_eq!(status.backends[0].status, BackendStatus::Exited);

        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_twice_is_safe() {
        let proxy = Proxy::new("test");
        proxy
            .register(BackendConfig::embedded("echo", echo_tools()))
            .await
            .unwrap();
        proxy.startup().await.unwrap();
        proxy.shutdown().await;
        proxy.shutdown().await;
        assert!(proxy.endpoints().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_without_startup_is_safe() {
        let proxy = Proxy::new("test");
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_filters() {
        let proxy = Proxy::new("test");
        proxy
            .register(
                BackendConfig::embedded("guarded", echo_tools())
                    .whitelist(["say"])
                    .blacklist(["divide", "ban"]),
            )
            .await
            .unwrap();

        let status = proxy.status().await;
        assert!(!status.running);
        let entry = &status.backends[0];
        assert_eq!(entry.kind, "embedded");
        assert_eq!(entry.whitelist.as_deref(), Some(&["say".to_string()][..]));
        assert_eq!(
            entry.blacklist.as_deref(),
            Some(&["ban".to_string(), "divide".to_string()][..])
        );
    }

    #[tokio::test]
    async fn load_registrations_skips_bad_entries() {
        let proxy = Proxy::new("test");
        let doc = json!({
            "mcpServers": {
                "good": {"start": "cat"},
                "bad": {"env": {}},
            }
        });
        assert_eq!(proxy.load_registrations(&doc).await, 1);
        let status = proxy.status().await;
        assert_eq!(status.backends.len(), 1);
        assert_eq!(status.backends[0].name, "good");
    }
}
