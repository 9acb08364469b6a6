//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (connection, dispatch and cache counters)
//!     → reporter.rs (errors swallowed by connection tasks)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Errors that never reach a caller go through an injected `ErrorReporter`
//! - Metrics are cheap (atomic increments) and are no-ops without a recorder

pub mod logging;
pub mod metrics;
pub mod reporter;

pub use reporter::{ErrorReporter, LogReporter};
