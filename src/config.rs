//! Server configuration resolved from CLI arguments.

use std::path::PathBuf;

/// Which runtime backend provisions workspace environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Namespace/chroot sandbox. Requires root.
    Container,
    /// Plain subprocess with a per-workspace virtualenv. Shares the host
    /// process and filesystem namespaces.
    Process,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Resolved server configuration, fixed at process start.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory holding one private subdirectory per workspace.
    pub data_dir: PathBuf,
    /// Selected runtime backend.
    pub backend: BackendKind,
    /// Shell program exec'd for interactive terminal sessions.
    pub shell: String,
    /// Interpreter used to create per-workspace virtualenvs.
    pub python: String,
    /// Whether provisioned runtimes may reach the network.
    pub allow_network: bool,
    /// Address-space cap for sandboxed shells, in KB.
    pub mem_limit_kb: u64,
}

impl Config {
    pub fn new(backend: BackendKind, data_dir: Option<PathBuf>) -> Self {
        Self {
            data_dir: data_dir
                .unwrap_or_else(|| std::env::temp_dir().join("workbench-workspaces")),
            backend,
            shell: "/bin/bash".to_string(),
            python: "python3".to_string(),
            allow_network: false,
            mem_limit_kb: 2_097_152,
        }
    }
}
