//! # Error types used by the daemon runtime and the dispatch path.
//!
//! This module defines two main error enums:
//!
//! - [`RuntimeError`] errors raised by the daemon lifecycle itself.
//! - [`DispatchError`] errors raised while moving a single message.
//!
//! Both types provide helper methods `as_label` for log fields.
//! [`DispatchError`] additionally distinguishes per-message failures that
//! should be reported upstream from ones that are purely local.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// # Errors produced by the daemon runtime.
///
/// These represent fatal startup failures and shutdown anomalies. Every
/// variant constructed before the transport is up maps to process exit
/// code 1.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration file could not be read or parsed.
    #[error("cannot load configuration from '{path}': {reason}")]
    Config {
        /// Path of the offending file.
        path: PathBuf,
        /// Human-readable parse or I/O failure.
        reason: String,
    },

    /// Client identity could not be derived.
    #[error("cannot derive client id: {reason}")]
    Identity { reason: String },

    /// The local RPC socket could not be bound.
    #[error("cannot listen on socket '{addr}': {source}")]
    SocketBind {
        /// The requested socket address.
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote transport could not be constructed or started.
    #[error("cannot start transport: {reason}")]
    Transport { reason: String },

    /// The worker directory could not be created or scanned.
    #[error("cannot prepare worker directory '{path}': {source}")]
    WorkerDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Orphaned workers from a previous run could not be swept.
    #[error("cannot kill orphaned workers: {reason}")]
    OrphanSweep { reason: String },

    /// Shutdown grace period was exceeded; some workers had to be force-killed.
    #[error("shutdown grace {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Executable paths of workers that did not exit in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Config { .. } => "runtime_config",
            RuntimeError::Identity { .. } => "runtime_identity",
            RuntimeError::SocketBind { .. } => "runtime_socket_bind",
            RuntimeError::Transport { .. } => "runtime_transport",
            RuntimeError::WorkerDir { .. } => "runtime_worker_dir",
            RuntimeError::OrphanSweep { .. } => "runtime_orphan_sweep",
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }

    /// Indicates whether the error is a fatal startup failure (exit 1).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RuntimeError::GraceExceeded { .. })
    }
}

/// # Errors produced while moving a single message.
///
/// These never abort the daemon; they are logged, optionally reported
/// upstream as an error event, and the message is considered handled.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No registered worker claims the message's directive.
    #[error("no worker registered for directive '{directive}'")]
    UnknownHandler { directive: String },

    /// A worker-side RPC failed outright.
    #[error("worker rpc failed: {reason}")]
    Rpc { reason: String },

    /// A worker-side RPC did not complete within its deadline.
    #[error("worker rpc deadline {deadline:?} exceeded")]
    Deadline { deadline: Duration },

    /// Inbound bytes did not decode as a message.
    #[error("cannot decode message: {reason}")]
    Decode { reason: String },

    /// An internal queue was closed while the message was in flight.
    #[error("dispatch queue closed")]
    QueueClosed,
}

impl DispatchError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::UnknownHandler { .. } => "dispatch_unknown_handler",
            DispatchError::Rpc { .. } => "dispatch_rpc",
            DispatchError::Deadline { .. } => "dispatch_deadline",
            DispatchError::Decode { .. } => "dispatch_decode",
            DispatchError::QueueClosed => "dispatch_queue_closed",
        }
    }

    /// Indicates whether the failure should be correlated back upstream
    /// when the message carried a `response_to`.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownHandler { .. }
                | DispatchError::Rpc { .. }
                | DispatchError::Deadline { .. }
        )
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(e: std::io::Error) -> Self {
        DispatchError::Rpc {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        DispatchError::Decode {
            reason: e.to_string(),
        }
    }
}
