//! Common error types for the topology manager.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PtmError`].
pub type PtmResult<T> = Result<T, PtmError>;

/// Errors raised while configuring, starting or stopping a topology.
#[derive(Error, Diagnostic, Debug)]
pub enum PtmError {
    /// Missing or malformed field in the topology or settings document.
    #[error("Configuration error at {key}: {message}")]
    #[diagnostic(code(ptm::config))]
    Config {
        /// Path of the offending object (e.g. `zookeepers[1]`).
        key: String,
        /// What is wrong with it.
        message: String,
    },

    /// A host, interface or bridge reference did not resolve.
    #[error("{kind} not found: {name}")]
    #[diagnostic(code(ptm::not_found))]
    ObjectNotFound {
        /// Kind of object (host, interface, bridge, ...).
        kind: &'static str,
        /// The unresolved identifier.
        name: String,
    },

    /// Invalid CLI or API argument.
    #[error("Argument mismatch: {message}")]
    #[diagnostic(code(ptm::argument), help("Run with --help for usage"))]
    ArgumentMismatch {
        /// The error message.
        message: String,
    },

    /// A command exited with a non-zero status.
    #[error("Command failed ({code}): {command}: {stderr}")]
    #[diagnostic(code(ptm::command))]
    CommandFailed {
        /// The command line.
        command: String,
        /// Exit code, -1 when killed by a signal.
        code: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// The isolated host-control child returned non-zero.
    #[error("Host control failed for {host}: command '{command}' exited with {code}")]
    #[diagnostic(
        code(ptm::host_control),
        help("Check ptm-host-ctl.log in the log directory")
    )]
    HostControlFailed {
        /// Host name.
        host: String,
        /// Control verb (start, stop, ...).
        command: String,
        /// Child exit code.
        code: i32,
    },

    /// A readiness poll exceeded its retry budget.
    #[error("Timed out waiting for {operation} on {host}")]
    #[diagnostic(code(ptm::timeout))]
    Timeout {
        /// Host name.
        host: String,
        /// Operation that timed out.
        operation: String,
    },

    /// A readiness probe's network exchange failed.
    #[error("Socket error talking to {address}: {message}")]
    #[diagnostic(code(ptm::socket))]
    Socket {
        /// Remote address.
        address: String,
        /// The error message.
        message: String,
    },

    /// A lifecycle operation was called out of order.
    #[error("Cannot {operation} host {host} in state {state}")]
    #[diagnostic(code(ptm::state))]
    InvalidState {
        /// Host name.
        host: String,
        /// Requested operation.
        operation: String,
        /// Current state.
        state: String,
    },

    /// A network device does not exist in the given context.
    #[error("Link {name} not found in {context}")]
    #[diagnostic(code(ptm::link_not_found))]
    LinkNotFound {
        /// Device name.
        name: String,
        /// Execution context.
        context: String,
    },

    /// A network namespace does not exist.
    #[error("Network namespace not found: {name}")]
    #[diagnostic(code(ptm::netns_not_found))]
    NamespaceNotFound {
        /// Namespace name.
        name: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(ptm::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(ptm::serialization))]
    Serialization(String),
}

impl PtmError {
    /// Shorthand for a [`PtmError::Config`].
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`PtmError::ObjectNotFound`].
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            kind,
            name: name.into(),
        }
    }

    /// True when the error means the object is already gone.
    ///
    /// Teardown treats these as success.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::LinkNotFound { .. } | Self::NamespaceNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for PtmError {
    fn from(err: serde_json::Error) -> Self {
        PtmError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PtmError {
    fn from(err: toml::de::Error) -> Self {
        PtmError::config("settings", err.to_string())
    }
}
