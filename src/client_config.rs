//! Client-configuration generators.
//!
//! Pure functions from (proxy name, set of endpoint paths) to the JSON
//! blob a particular AI client consumes, plus the atomic file write used
//! to hand it over. Adding a client flavor means adding a `ClientKind`
//! variant and its `generate` arm; nothing in the core changes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ClientKind {
    /// Gemini CLI: reaches each endpoint through a socat stdio bridge.
    Gemini,
    /// Claude-style clients that connect to Unix sockets directly.
    Claude,
}

impl ClientKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ClientKind::Gemini => "settings.json",
            ClientKind::Claude => "claude_config.json",
        }
    }
}

/// Build the client configuration: one entry per backend, keyed by backend
/// name, wiring the client to `<scratch>/<name>.sock`.
pub fn generate(kind: ClientKind, endpoints: &[(String, PathBuf)]) -> Value {
    match kind {
        ClientKind::Gemini => {
            let socat = resolve_socat();
            let servers: serde_json::Map<String, Value> = endpoints
                .iter()
                .map(|(name, path)| {
                    (
                        name.clone(),
                        json!({
                            "command": socat,
                            "args": ["STDIO", format!("UNIX-CONNECT:{}", path.display())],
                        }),
                    )
                })
                .collect();
            json!({"mcpServers": servers})
        }
        ClientKind::Claude => {
            let servers: serde_json::Map<String, Value> = endpoints
                .iter()
                .map(|(name, path)| {
                    (
                        name.clone(),
                        json!({
                            "transport": "unix_socket",
                            "socket_path": path.display().to_string(),
                            "protocol": "stdio",
                        }),
                    )
                })
                .collect();
            json!({"mcp_servers": servers})
        }
    }
}

/// Absolute path to socat when it is on PATH, bare "socat" otherwise.
fn resolve_socat() -> String {
    let Some(path_var) = std::env::var_os("PATH") else {
        return "socat".to_string();
    };
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join("socat");
        if candidate.is_file() {
            return candidate.display().to_string();
        }
    }
    "socat".to_string()
}

/// Write the configuration into `dir` via a same-directory temp file and
/// atomic rename, mode 0600. Refuses a symlinked destination directory.
pub fn write_atomic(config: &Value, dir: &Path, kind: ClientKind) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let meta = dir
        .symlink_metadata()
        .with_context(|| format!("failed to stat config directory {}", dir.display()))?;
    if meta.file_type().is_symlink() {
        bail!(
            "refusing to write client config into symlinked directory {}",
            dir.display()
        );
    }

    let destination = dir.join(kind.file_name());
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;

    let body = format!("{}\n", serde_json::to_string_pretty(config)?);
    std::fs::write(tmp.path(), body).context("failed to write client config")?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
            .context("failed to set client config permissions")?;
    }

    tmp.persist(&destination)
        .with_context(|| format!("failed to move client config to {}", destination.display()))?;
    Ok(destination)
}
