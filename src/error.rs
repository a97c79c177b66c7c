//! Error types for the switching core.
//!
//! Each component owns one error enum. The command layer wraps these in
//! `anyhow::Error` with context before they reach the user.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Field name not known to the store.
    #[error("unknown config field '{0}'")]
    UnknownField(String),

    /// A dynamic value had the wrong JSON type for its field.
    #[error("config field '{field}' expects {expected}, got {actual}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// Both credential markers would be true at once.
    #[error("credential markers are exclusive: cannot set '{0}' while the other marker is set")]
    MarkerConflict(&'static str),

    /// The directory holding the config file is missing or not writable.
    #[error("config directory is not usable: {}", .path.display())]
    DirectoryUnwritable {
        path: PathBuf,
        #[source]
        source: Option<io::Error>,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A setting is present but cannot be used for a run.
    #[error("{0}")]
    Invalid(String),
}

/// Errors raised by the cipher layer.
///
/// `InvalidCiphertext` is an expected signal: the swap engine uses it to
/// detect a credential file that is not encrypted with the current key.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("data is not valid ciphertext for this key")]
    InvalidCiphertext,

    #[error("cipher I/O failed on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while swapping profile directories.
#[derive(Debug, Error)]
pub enum SwapError {
    /// No profile directory carries the marker for this tag.
    #[error("no profile directory found for tag '{0}'")]
    TagUnresolved(String),

    /// A directory required for the second rename step does not exist.
    #[error("profile directory is missing: {}", .0.display())]
    MissingProfile(PathBuf),

    /// Every attempt failed with a permission error.
    #[error("permission denied renaming {} after {attempts} attempts", .path.display())]
    PermissionExhausted { path: PathBuf, attempts: u32 },

    #[error("rename {} -> {} failed", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised by process primitives and the monitor.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("client executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("failed to launch {}", .path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("client '{name}' did not start after {attempts} checks")]
    StartupTimeout { name: String, attempts: u32 },

    #[error("failed to terminate '{name}': {reason}")]
    Terminate { name: String, reason: String },

    #[error("failed to enumerate processes")]
    Enumerate(#[source] io::Error),

    #[error("process monitor is already running")]
    MonitorRunning,

    #[error("process monitor failed to start")]
    MonitorStart(#[source] io::Error),
}
