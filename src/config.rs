//! Backend and proxy configuration.
//!
//! Backends are declared either programmatically through the builder
//! methods on [`BackendConfig`] or via a JSON registration document of the
//! shape `{"mcpServers": {"<name>": {...}}}`, where each entry provides
//! either `{"start": "<command line>"}` (POSIX-tokenized) or
//! `{"command": "...", "args": [...]}` (already tokenized).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::embedded::ToolSet;
use crate::error::ConfigError;
use crate::filter::AccessFilter;
use crate::intercept::{AfterHook, BeforeHook, InterceptorSet};

/// Proxy-wide tunables shared by every endpoint.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Cap on concurrently served client connections across all endpoints.
    pub max_connections: usize,
    /// Longest accepted wire line; longer lines close the connection.
    pub max_message_bytes: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

fn default_max_connections() -> usize {
    100
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration for one backend. Exactly one of `command` (external child
/// process) or `tools` (embedded in-process handler) must be set.
#[derive(Clone)]
pub struct BackendConfig {
    pub name: String,

    /// Program to spawn (external backends).
    pub command: Option<String>,
    pub args: Vec<String>,

    /// Environment overlaid on the computed base environment.
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,

    /// When false the child starts from a minimal sanitized environment
    /// (`PATH` and `LANG` only) instead of inheriting the proxy's.
    pub inherit_env: bool,

    /// Whether `startup()` starts this backend.
    pub auto_start: bool,

    /// Deadline for a backend to answer one request.
    pub timeout: Duration,

    pub filter: AccessFilter,

    /// Embedded tool set (embedded backends).
    pub tools: Option<Arc<ToolSet>>,

    /// Before/after hook stages; always present, possibly empty.
    pub interceptors: InterceptorSet,
}

impl BackendConfig {
    /// Config for an external child-process backend.
    pub fn external(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            inherit_env: false,
            auto_start: true,
            timeout: default_timeout(),
            filter: AccessFilter::default(),
            tools: None,
            interceptors: InterceptorSet::default(),
        }
    }

    /// Config for an embedded in-process backend.
    pub fn embedded(name: impl Into<String>, tools: ToolSet) -> Self {
        Self {
            name: name.into(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            inherit_env: false,
            auto_start: true,
            timeout: default_timeout(),
            filter: AccessFilter::default(),
            tools: Some(Arc::new(tools)),
            interceptors: InterceptorSet::default(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn auto_start(mut self, auto: bool) -> Self {
        self.auto_start = auto;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn whitelist<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.whitelist = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn blacklist<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.blacklist = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn intercept_before(mut self, tool: impl Into<String>, hook: BeforeHook) -> Self {
        self.interceptors.set_before(tool, hook);
        self
    }

    pub fn intercept_after(mut self, tool: impl Into<String>, hook: AfterHook) -> Self {
        self.interceptors.set_after(tool, hook);
        self
    }

    pub fn is_external(&self) -> bool {
        self.command.is_some()
    }

    pub fn kind(&self) -> &'static str {
        if self.is_external() { "external" } else { "embedded" }
    }

    /// Enforce the registration invariants: a well-formed name and exactly
    /// one of command/embedded tools.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_name(&self.name) {
            return Err(ConfigError::InvalidName(self.name.clone()));
        }
        if self.command.is_some() == self.tools.is_some() {
            return Err(ConfigError::AmbiguousKind(self.name.clone()));
        }
        Ok(())
    }

    /// Build a registration entry from one `mcpServers` value.
    pub fn from_registration(name: &str, spec: &serde_json::Value) -> Result<Self, ConfigError> {
        let spec: ServerSpec =
            serde_json::from_value(spec.clone()).map_err(|e| ConfigError::InvalidSpec {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let (command, args) = match (spec.start, spec.command) {
            (Some(start), _) => {
                let parts = shlex::split(&start).unwrap_or_default();
                let Some((command, args)) = parts.split_first() else {
                    return Err(ConfigError::BadCommandLine {
                        name: name.to_string(),
                        line: start,
                    });
                };
                (command.clone(), args.to_vec())
            }
            (None, Some(command)) => (command, spec.args),
            (None, None) => {
                return Err(ConfigError::InvalidSpec {
                    name: name.to_string(),
                    reason: "missing 'start' or 'command'".to_string(),
                });
            }
        };

        let mut config = BackendConfig::external(name, command).args(args);
        config.env = spec.env;
        config.cwd = spec.cwd;
        config.inherit_env = spec.inherit_env;
        config.auto_start = spec.auto_start;
        config.filter = AccessFilter {
            whitelist: spec.whitelist.map(|w| w.into_iter().collect()),
            blacklist: spec.blacklist.map(|b| b.into_iter().collect()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Environment for the child process. `inherit_env=false` starts from a
    /// minimal sanitized base rather than the proxy's full environment; the
    /// backend's explicit `env` is overlaid in both cases.
    pub fn build_child_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = if self.inherit_env {
            std::env::vars().collect()
        } else {
            let mut base = HashMap::new();
            base.insert(
                "PATH".to_string(),
                std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin:/usr/sbin:/sbin".into()),
            );
            base.insert(
                "LANG".to_string(),
                std::env::var("LANG").unwrap_or_else(|_| "C.UTF-8".into()),
            );
            base
        };
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("command", &self.command)
            .field("args", &self.args)
            .field("auto_start", &self.auto_start)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Backend names become socket file names; restrict them accordingly.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// One entry of the `mcpServers` registration document.
#[derive(Debug, Deserialize)]
pub(crate) struct ServerSpec {
    start: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    whitelist: Option<Vec<String>>,
    blacklist: Option<Vec<String>>,
    #[serde(default = "default_true")]
    auto_start: bool,
    #[serde(default)]
    inherit_env: bool,
}

fn default_true() -> bool {
    true
}
