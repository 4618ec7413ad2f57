//! Error types for the boxport core library.

use std::path::PathBuf;

/// The main error type for box export operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The machine has never been created, so there is nothing to export.
    #[error("the machine has not been created yet")]
    NotCreated,

    /// The provider's export tool wrote an error message instead of progress.
    #[error("export tool failed: {message}")]
    ExportTool { message: String },

    /// Packaging finished without leaving an archive behind.
    #[error("packaging failed: no archive at '{}'", path.display())]
    TarFailed { path: PathBuf },

    /// An external executable could not be found or spawned.
    #[error("required tool '{program}' was not found")]
    ToolNotFound { program: String },

    /// An external executable ran but exited with a non-zero status.
    #[error("'{program}' exited with status {status}")]
    ToolFailed { program: String, status: i32 },

    /// The guest command channel failed outside of a command's exit status.
    #[error("command channel error: {message}")]
    Channel { message: String },

    /// Error parsing a VMX file.
    #[error("VMX parse error: {message}")]
    VmxParse { message: String },

    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },
}

/// A specialized Result type for box export operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an export tool error.
    pub fn export_tool(message: impl Into<String>) -> Self {
        Self::ExportTool {
            message: message.into(),
        }
    }

    /// Create a packaging failure for the archive that should exist at `path`.
    pub fn tar_failed(path: impl Into<PathBuf>) -> Self {
        Self::TarFailed { path: path.into() }
    }

    /// Create a missing-tool error.
    pub fn tool_not_found(program: impl Into<String>) -> Self {
        Self::ToolNotFound {
            program: program.into(),
        }
    }

    /// Create a non-zero exit error.
    pub fn tool_failed(program: impl Into<String>, status: i32) -> Self {
        Self::ToolFailed {
            program: program.into(),
            status,
        }
    }

    /// Create a command channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// Create a VMX parse error.
    pub fn vmx_parse(message: impl Into<String>) -> Self {
        Self::VmxParse {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
