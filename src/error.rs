/// Unified error handling for the relevo connectivity layer
///
/// Two layers of errors exist. `EngineError` is what an engine adapter
/// reports for one physical operation; the core classifies it to decide
/// whether the connection was lost. `RelevoError` is the caller-facing
/// taxonomy: connectivity loss, topology failures, failover outcomes,
/// and terminal states.
use aho_corasick::AhoCorasick;
use lazy_static::lazy_static;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::{ClusterId, Endpoint, HostRole};

/// Phrases that mark an engine-reported error as a lost connection.
/// Matched case-insensitively against the error text, the same way
/// engine drivers match their own disconnect messages.
const CONNECTIVITY_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection aborted",
    "connection closed",
    "connection lost",
    "lost connection",
    "broken pipe",
    "unexpected eof",
    "server closed the connection",
    "server shutdown",
    "shutting down",
    "terminating connection",
    "network unreachable",
    "host unreachable",
    "econnreset",
    "econnrefused",
    "epipe",
    "etimedout",
    "timed out",
];

lazy_static! {
    static ref CONNECTIVITY_FINDER: AhoCorasick = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(CONNECTIVITY_PATTERNS)
        .expect("Failed to create AhoCorasick connectivity matcher");
}

/// Whether an engine error message reads like a lost connection
pub fn message_indicates_connection_loss(message: &str) -> bool {
    CONNECTIVITY_FINDER.is_match(message)
}

/// Error reported by an engine adapter for one physical operation
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level failure
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// A deadline imposed by this layer expired
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The wire conversation desynchronized; the connection is unusable
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// The server answered with an error (not a transport failure)
    #[error("server error: {0}")]
    Server(String),
}

impl EngineError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        EngineError::Protocol(message.into())
    }

    /// Create a server-reported error
    pub fn server<S: Into<String>>(message: S) -> Self {
        EngineError::Server(message.into())
    }

    /// Create a timeout error
    pub fn timeout(elapsed: Duration) -> Self {
        EngineError::Timeout(elapsed)
    }

    /// Classify this error: does it mean the physical connection is gone?
    ///
    /// I/O errors are classified by kind first, then by message text.
    /// Timeouts and protocol desyncs always poison the connection. Server
    /// errors are ordinary results (a failed statement is not a failover
    /// trigger) unless their text names a disconnect.
    pub fn is_connectivity_loss(&self) -> bool {
        match self {
            EngineError::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::NotConnected
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::UnexpectedEof
                ) || message_indicates_connection_loss(&e.to_string())
            }
            EngineError::Timeout(_) => true,
            EngineError::Protocol(_) => true,
            EngineError::Server(message) => message_indicates_connection_loss(message),
        }
    }
}

/// Main error type for relevo operations
#[derive(Debug, Error)]
pub enum RelevoError {
    /// Connectivity to the bound host was lost; the failover machine ran
    /// (or will run), and the caller may retry the operation
    #[error("transient connectivity failure on {endpoint}: {source}")]
    TransientConnectivity {
        endpoint: Endpoint,
        #[source]
        source: EngineError,
    },

    /// Every reachable host failed to answer the membership query; the
    /// stale cached topology remains usable
    #[error("topology query failed for cluster '{cluster}': {message}")]
    TopologyQuery { cluster: ClusterId, message: String },

    /// No candidate host satisfies the required role within the failover
    /// window; the logical connection is terminally failed
    #[error("no {role} host available in cluster '{cluster}'")]
    NoAvailableHost { cluster: ClusterId, role: HostRole },

    /// The writer-election wait or a reconnect deadline expired
    #[error("failover timed out during {phase} after {elapsed:?}")]
    FailoverTimeout { phase: String, elapsed: Duration },

    /// A failover is running on this logical connection; retry shortly
    #[error("failover in progress; retry this operation")]
    FailoverInProgress,

    /// The logical connection was closed by the caller
    #[error("connection is closed")]
    ConnectionClosed,

    /// A previous failover exhausted its options; close and reopen
    #[error("connection failed permanently; close and reopen it")]
    FailedPermanently,

    /// Engine error that does not affect connectivity, passed through
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for relevo operations
pub type RelevoResult<T> = Result<T, RelevoError>;

/// Convenience methods for creating specific error types
impl RelevoError {
    /// Create a transient connectivity error for a host
    pub fn transient(endpoint: Endpoint, source: EngineError) -> Self {
        RelevoError::TransientConnectivity { endpoint, source }
    }

    /// Create a topology query error
    pub fn topology_query<S: Into<String>>(cluster: ClusterId, message: S) -> Self {
        RelevoError::TopologyQuery {
            cluster,
            message: message.into(),
        }
    }

    /// Create a no-available-host error
    pub fn no_available_host(cluster: ClusterId, role: HostRole) -> Self {
        RelevoError::NoAvailableHost { cluster, role }
    }

    /// Create a failover timeout error
    pub fn failover_timeout<S: Into<String>>(phase: S, elapsed: Duration) -> Self {
        RelevoError::FailoverTimeout {
            phase: phase.into(),
            elapsed,
        }
    }

    /// Check if the caller may retry the failed call on this connection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelevoError::TransientConnectivity { .. }
                | RelevoError::TopologyQuery { .. }
                | RelevoError::FailoverInProgress
        )
    }

    /// Check if this error leaves the logical connection unusable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelevoError::NoAvailableHost { .. }
                | RelevoError::FailoverTimeout { .. }
                | RelevoError::FailedPermanently
                | RelevoError::ConnectionClosed
        )
    }
}
