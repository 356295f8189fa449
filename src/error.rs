//! Error types for frameflow.

use thiserror::Error;

/// Result type alias using frameflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for frameflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller or configuration mistake (empty pipeline, malformed pattern, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown plugin name or unregistered implementation/extension.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource exists but is not usable yet (e.g. a file still being written).
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Both the primary and the fallback read target failed in one cycle.
    #[error("fatal I/O error: {0}")]
    FatalIo(String),

    /// Invalid pipeline tree operation.
    #[error("invalid tree operation: {0}")]
    Structure(String),

    /// A plugin rejected its input or failed while executing.
    #[error("plugin '{plugin}' failed: {message}")]
    Plugin {
        /// Name of the failing plugin.
        plugin: String,
        /// What went wrong.
        message: String,
    },

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid memory segment operation.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// Malformed message on a worker socket.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The other end of a worker channel went away.
    #[error("channel disconnected: {0}")]
    Disconnected(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// Frame decoding failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// TOML document could not be parsed.
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// Glob pattern could not be compiled.
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),
}

impl Error {
    /// Shorthand for a plugin execution error.
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Whether this error must end the whole run rather than one cycle.
    ///
    /// Configuration and lookup errors are caller mistakes and are never
    /// retried. Everything else aborts at most the current cycle.
    pub fn terminates_run(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::NotFound(_) | Self::Structure(_) | Self::Toml(_) | Self::Glob(_)
        )
    }

    /// Whether this error is expected and transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_terminating_classification() {
        assert!(Error::Config("tree empty".into()).terminates_run());
        assert!(Error::NotFound("nope".into()).terminates_run());
        assert!(!Error::FatalIo("both unreadable".into()).terminates_run());
        assert!(!Error::ResourceUnavailable("half written".into()).terminates_run());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::ResourceUnavailable("x".into()).is_transient());
        assert!(!Error::FatalIo("x".into()).is_transient());
    }

    #[test]
    fn test_plugin_error_display() {
        let err = Error::plugin("clamp_low", "expected a frame");
        assert_eq!(err.to_string(), "plugin 'clamp_low' failed: expected a frame");
    }
}
