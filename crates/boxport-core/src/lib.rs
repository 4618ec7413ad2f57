//! boxport Core Library
//!
//! This crate exports VirtualBox and VMware virtual machines into box
//! archives: a gzip-compressed tar holding the provider's disk images and
//! descriptors, a `metadata.json`, and optional configuration fragments.
//!
//! # Overview
//!
//! The main entry point is [`ExportPipeline`], which runs the stages in
//! order against a [`Machine`] handle supplied by the host. The host also
//! supplies a [`ToolRunner`] for external executables and a [`Ui`] for
//! user-facing output.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`machine`] - Machine handle, provider kinds and guest command channel
//! - [`runner`] - External tool execution with streamed output
//! - [`progress`] - Progress parsing and the status line
//! - [`workspace`] - Staging directory and temporary archive lifecycle
//! - [`compress`] - In-guest disk cleanup
//! - [`extract`] - Provider artifact extraction
//! - [`assemble`] - Metadata, template merge and configuration fragments
//! - [`package`] - Archive creation
//! - [`finalize`] - Publishing the archive under its final name
//! - [`export`] - Export orchestrator coordinating the full pipeline
//! - [`vmx`] - VMX and machine-readable key/value parsing

pub mod assemble;
pub mod compress;
pub mod error;
pub mod export;
pub mod extract;
pub mod finalize;
pub mod machine;
pub mod package;
pub mod progress;
pub mod runner;
pub mod vmx;
pub mod workspace;

pub use error::{Error, Result};

// Re-export main export functionality for convenience
pub use export::{
    ExportOptions, ExportOutcome, ExportPhase, ExportPipeline, ExportStatus, ToolPaths,
};
pub use machine::{
    CommandChannel, Communicator, Flow, Machine, MachineState, OutputSink, ProviderKind, SshInfo,
    StreamKind,
};
pub use progress::Ui;
pub use runner::{ProcessRunner, RunOutcome, ToolRunner};
