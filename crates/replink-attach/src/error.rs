//! Error types for discovery, attach and agent injection.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while locating, attaching to, or injecting into a JVM.
///
/// These never reach a front end directly: [`crate::auto`] converts them into
/// an [`crate::AttachOutcome`].
#[derive(Debug, Error)]
pub enum AttachError {
    /// I/O error talking to the attach socket or the filesystem
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to read process information from /proc
    #[error("failed to read process {pid}: {message}")]
    Procfs { pid: u32, message: String },

    /// The target never opened its attach listener
    #[error("attach listener of process {pid} did not start within {timeout:?}")]
    SocketTimeout { pid: u32, timeout: Duration },

    /// The target answered an attach command with a non-zero status
    #[error("attach command '{command}' failed with status {status}: {output}")]
    Command {
        command: String,
        status: i32,
        output: String,
    },

    /// The agent was loaded but reported failure
    #[error("agent failed to load in process {pid}: {message}")]
    AgentLoad { pid: u32, message: String },

    /// No agent artifact in any searched location
    #[error("agent JAR not found (searched: {})", format_searched(.searched))]
    AgentNotFound { searched: Vec<PathBuf> },

    /// Discovery found nothing worth attaching to
    #[error("no candidate Spring Boot JVM found")]
    NoCandidates,
}

fn format_searched(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "nothing".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for attach operations.
pub type Result<T> = std::result::Result<T, AttachError>;
