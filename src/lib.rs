//! Protocol-unifying HTTP server library.
//!
//! Serves plain HTTP/1.1, HTTP/1.1 over TLS and HTTP/2 over TLS, hands every
//! request to one handler as a `NormalizedRequest`, and shuts down either
//! gracefully or by force.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::{ListenerMode, ListenerSpec, ServerConfig, TlsOptions};
pub use config::ConfigError;
pub use http::{NormalizedRequest, PathFormat, RequestListener, ResponseBody, ResponseHead};
pub use lifecycle::{Server, ServerError, ShutdownHandle};
pub use observability::{ErrorReporter, LogReporter};
