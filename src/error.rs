//! Error types for the forwarder core
//!
//! This module defines the error hierarchy shared by the upstream pool,
//! the policy pipeline, and the transport interface.
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Pipeline errors**: policy module failures and malformed requests
//! - **Probe errors**: DoH/DNSCrypt server validation failures
//! - **Relay errors**: anonymization route misconfiguration
//! - **Config errors**: invalid configuration parameters
//! - **Fatal errors**: startup-time misconfiguration that must abort
//!
//! # Example
//!
//! ```
//! use veildns::error::ProxyError;
//!
//! let err = ProxyError::timeout("query to 9.9.9.9:443", std::time::Duration::from_secs(5));
//! assert!(err.is_recoverable());
//! assert!(err.is_timeout());
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias used throughout the crate
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Error types for forwarder operations
///
/// # Recoverability
///
/// Errors are classified as either recoverable or non-recoverable:
/// - **Recoverable**: transient issues that may succeed on retry
///   (timeouts, network errors, failed refresh probes)
/// - **Non-recoverable**: failures requiring configuration changes
///
/// Per-request errors are turned into a DNS response by the caller; the
/// only errors that should abort the process are the [`ProxyError::Fatal`]
/// ones surfaced during startup.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// DNS message parsing failed
    #[error("Failed to parse DNS message: {reason}")]
    Parse {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// DNS message serialization failed
    #[error("Failed to serialize DNS message: {reason}")]
    Serialize {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// A DNS message carried more than one question
    #[error("Unexpected number of questions: {count}")]
    BadQuestionCount {
        /// The offending question count
        count: usize,
    },

    /// A policy module returned an error from its evaluation hook
    ///
    /// The stage that was running aborts and the request is dropped.
    #[error("Policy module '{module}' failed: {reason}")]
    Module {
        /// Name of the module that failed
        module: String,
        /// Description of the failure
        reason: String,
    },

    /// A server stamp carries a protocol this core cannot use
    #[error("Unsupported protocol: {proto}")]
    UnsupportedProtocol {
        /// The protocol name from the stamp
        proto: String,
    },

    /// The TLS handshake with a DoH server did not complete
    #[error("TLS handshake failed for [{server}]")]
    TlsHandshakeFailed {
        /// Server name from the registry
        server: String,
    },

    /// No peer certificate matched the pinned hashes in the stamp
    #[error("Certificate hash not found for [{server}]")]
    CertificateHashMismatch {
        /// Server name from the registry
        server: String,
    },

    /// The DoH probe returned something that is not a plausible DNS response
    #[error("Webserver returned an unexpected response for [{server}]: {reason}")]
    UnexpectedDohResponse {
        /// Server name from the registry
        server: String,
        /// What was wrong with the response
        reason: String,
    },

    /// A route was declared for a server but its relay list is empty
    #[error("Route declared for [{server}] but an empty relay list")]
    EmptyRelayList {
        /// Server name the route applies to
        server: String,
    },

    /// A relay reference could not be resolved to any known relay
    #[error("Undefined relay [{relay}] for server [{server}]")]
    UndefinedRelay {
        /// The unresolvable relay reference
        relay: String,
        /// Server name the route applies to
        server: String,
    },

    /// A relay resolved to a stamp whose protocol cannot relay DNSCrypt
    #[error("Invalid relay [{relay}] for server [{server}]")]
    InvalidRelayProto {
        /// The offending relay reference
        relay: String,
        /// Server name the route applies to
        server: String,
    },

    /// An upstream attempt exceeded its deadline
    #[error("Timed out after {timeout:?}: {context}")]
    Timeout {
        /// Description of what timed out
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// Network I/O error
    #[error("Network error: {reason}")]
    Network {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field that is invalid, if applicable
        field: Option<String>,
    },

    /// Startup-time misconfiguration that must abort the process
    ///
    /// The only errors of this kind are malformed server public keys in
    /// stamps and a probe answering for a different server name than the
    /// one it was asked about.
    #[error("Fatal: {reason}")]
    Fatal {
        /// Description of the fatal condition
        reason: String,
    },
}

impl ProxyError {
    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::Serialize {
            reason: reason.into(),
        }
    }

    /// Create a policy module error
    pub fn module(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Module {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create a network error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error from an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error with field context
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a fatal startup error
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Whether a retry may succeed without operator intervention
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Network { .. }
                | Self::TlsHandshakeFailed { .. }
                | Self::UnexpectedDohResponse { .. }
        )
    }

    /// Whether this error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}
