//! manifold — a multiplexing proxy for the Model Context Protocol.
//!
//! Declare N heterogeneous MCP backends (external child processes or
//! embedded in-process tool sets) in one [`Proxy`]; each backend is exposed
//! on its own Unix-domain socket under a private scratch directory,
//! speaking newline-delimited JSON-RPC 2.0. Tool access is governed per
//! backend by whitelist/blacklist filters and user-supplied before/after
//! interceptors; the generated client configuration wires an AI client to
//! every endpoint.
//!
//! ```no_run
//! use manifold::backend::embedded::{ToolDef, ToolSet, text_content};
//! use manifold::{BackendConfig, Proxy};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let proxy = Proxy::new("demo");
//! let tools = ToolSet::new().tool(ToolDef::new(
//!     "say",
//!     "Echo a message",
//!     serde_json::json!({"type": "object"}),
//!     |args| Ok(text_content(args["msg"].as_str().unwrap_or(""))),
//! ));
//! proxy.register(BackendConfig::embedded("echo", tools)).await?;
//! proxy.register(BackendConfig::external("search", "npx").args(["some-mcp-server"])).await?;
//! proxy.startup().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client_config;
pub mod config;
mod endpoint;
pub mod error;
pub mod filter;
pub mod intercept;
pub mod jsonrpc;
pub mod proxy;
mod router;

#[cfg(test)]
mod testutil;

pub use config::{BackendConfig, ProxySettings};
pub use proxy::{Proxy, ProxyStatus};
