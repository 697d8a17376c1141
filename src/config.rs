//! Pool configuration and the server registry.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Launch description for one language server.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerSpec {
    /// Logical name, e.g. `python` or `typescript`.
    pub name: String,
    /// Argv used to launch the server; the binary is discovered on `PATH`.
    pub command: Vec<String>,
    /// File extensions (without dot) routed to this server.
    pub extensions: Vec<String>,
    /// Filenames that mark a workspace root, in priority order.
    #[serde(default = "default_root_markers")]
    pub root_markers: Vec<String>,
    /// Extra environment variables for the child. The parent environment is
    /// always inherited.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_root_markers() -> Vec<String> {
    [".git", "pyproject.toml", "package.json", "go.mod", "Cargo.toml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// The server registry shipped by default: the common agent-facing stack.
pub fn default_server_specs() -> Vec<ServerSpec> {
    fn spec(name: &str, command: &[&str], extensions: &[&str]) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            root_markers: default_root_markers(),
            env: HashMap::new(),
        }
    }

    vec![
        spec("python", &["jedi-language-server"], &["py", "pyi"]),
        spec(
            "typescript",
            &["typescript-language-server", "--stdio"],
            &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
        ),
        spec("rust", &["rust-analyzer"], &["rs"]),
        spec("go", &["gopls"], &["go"]),
    ]
}

/// Per-operation request deadlines, in milliseconds.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OperationTimeouts {
    pub hover_ms: u64,
    pub definition_ms: u64,
    pub references_ms: u64,
    pub document_symbols_ms: u64,
    pub workspace_symbols_ms: u64,
    pub prepare_rename_ms: u64,
    pub rename_ms: u64,
    pub code_actions_ms: u64,
    pub code_action_resolve_ms: u64,
    pub extract_ms: u64,
    /// How long a diagnostics request waits for the first publish after a
    /// didOpen/didChange before returning what is cached.
    pub diagnostics_wait_ms: u64,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        OperationTimeouts {
            hover_ms: 5_000,
            definition_ms: 5_000,
            references_ms: 10_000,
            document_symbols_ms: 5_000,
            workspace_symbols_ms: 5_000,
            prepare_rename_ms: 5_000,
            rename_ms: 10_000,
            code_actions_ms: 5_000,
            code_action_resolve_ms: 10_000,
            extract_ms: 10_000,
            diagnostics_wait_ms: 2_000,
        }
    }
}

/// Top-level pool configuration.
///
/// Embedders deserialize this from their own config files; every field has a
/// production default.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Seconds of inactivity after which an initialized server is shut down
    /// by the health monitor.
    pub idle_timeout_seconds: u64,
    /// Seconds between health monitor ticks.
    pub health_check_interval_seconds: u64,
    /// Deadline for the health-check ping request, in seconds.
    pub health_check_timeout_seconds: u64,
    /// Truncation threshold for find-references output.
    pub max_references_returned: usize,
    /// Per-operation request deadlines.
    pub operation_timeouts: OperationTimeouts,
    /// The server registry.
    pub server_specs: Vec<ServerSpec>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            idle_timeout_seconds: 1_800,
            health_check_interval_seconds: 300,
            health_check_timeout_seconds: 5,
            max_references_returned: 30,
            operation_timeouts: OperationTimeouts::default(),
            server_specs: default_server_specs(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }
}
