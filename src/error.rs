//! Error types for the workspace engine.

/// Result type alias for workspace operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the workspace lifecycle.
///
/// Every failure maps to a distinguishable kind so callers can decide
/// whether to retry, prompt a re-upload, or give up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown workspace, runtime or file.
    #[error("not found: {0}")]
    NotFound(String),

    /// A relative path resolved outside the workspace root.
    #[error("path escapes workspace root: {path}")]
    PathEscape { path: String },

    /// Corrupt archive, or an archive carrying unsafe entry paths.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// The runtime backend could not create or attach to an environment.
    #[error("failed to provision runtime: {0}")]
    Provision(String),

    /// Dependency installation failed. Non-fatal for file editing.
    #[error("dependency install failed: {0}")]
    DependencyInstall(String),

    /// The workspace is in a state that forbids the requested operation.
    #[error("workspace is in state '{state}': operation not allowed")]
    InvalidState { state: String },

    /// Disk or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::PathEscape { .. } => "path_escape",
            Error::InvalidArchive(_) => "invalid_archive",
            Error::Provision(_) => "provision_error",
            Error::DependencyInstall(_) => "dependency_install_error",
            Error::InvalidState { .. } => "invalid_state",
            Error::Io(_) => "io_error",
        }
    }
}
