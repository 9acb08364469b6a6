//! Error reporting policy.
//!
//! Connection tasks, tunnel pumps and responders have no caller to return an
//! error to. They hand it to the `ErrorReporter` they were built with.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Where an unreportable error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Accept loop.
    Accept,
    /// TLS handshake on an accepted socket.
    Handshake,
    /// HTTP/1.1 or HTTP/2 connection driver.
    Connection,
    /// Upgrade or CONNECT tunnel pump.
    Tunnel,
    /// Request handler left a request unanswered or failed to respond.
    Handler,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSource::Accept => "accept",
            ErrorSource::Handshake => "handshake",
            ErrorSource::Connection => "connection",
            ErrorSource::Tunnel => "tunnel",
            ErrorSource::Handler => "handler",
        };
        f.write_str(name)
    }
}

/// Receives errors that cannot propagate to a caller.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, source: ErrorSource, listener_id: &str, error: &(dyn StdError + 'static));
}

/// Default reporter: forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, source: ErrorSource, listener_id: &str, error: &(dyn StdError + 'static)) {
        match source {
            // Peers dropping mid-handshake is routine.
            ErrorSource::Handshake => {
                tracing::debug!(listener = listener_id, source = %source, error = %error, "TLS handshake failed")
            }
            _ => tracing::warn!(listener = listener_id, source = %source, error = %error, "Error"),
        }
    }
}

/// Shared reporter handle.
pub type SharedReporter = Arc<dyn ErrorReporter>;

impl<F> ErrorReporter for F
where
    F: Fn(ErrorSource, &str, &(dyn StdError + 'static)) + Send + Sync + 'static,
{
    fn report(&self, source: ErrorSource, listener_id: &str, error: &(dyn StdError + 'static)) {
        self(source, listener_id, error)
    }
}
