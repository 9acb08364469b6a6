//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop)
//!     → plain: protocol adapter
//!     → TLS:   demux.rs (handshake, ALPN routing) → protocol adapter
//!
//! Connection States:
//!     Accepted → Handshaking (TLS) → Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - One TCP socket per `[address]:port`; two TLS listeners may share it
//! - Each connection tracked for graceful and forced shutdown
//! - Session tickets stay off; resumption uses the session-ID cache

pub mod address;
pub mod connection;
pub mod demux;
pub mod listener;
pub mod session_cache;
pub mod tls;
