//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Construction (server.rs):
//!     Validate listeners → Build adapters → Group TLS listeners → Build frontends
//!
//! listen() (server.rs):
//!     Bind every physical socket → Start accept loops
//!
//! close() (server.rs + shutdown.rs):
//!     Shutdown funcs → Stop accepting → Drain connections and tunnels
//!     → Close TLS frontends → Await shutdown futures
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - destroy() skips every wait and drops the connections
//! - Shutdown has no internal deadline; the binary applies one

pub mod server;
pub mod shutdown;
pub mod signals;

pub use server::{LifecycleState, Server, ServerError};
pub use shutdown::{ShutdownHandle, ShutdownKey};
