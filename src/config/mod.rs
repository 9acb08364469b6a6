//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → listeners handed to lifecycle::Server
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a server is built from it once
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::ConfigError;
pub use schema::{
    Http1Options, Http2Options, ListenerMode, ListenerSpec, ServerConfig, TlsOptions,
    TransportOptions,
};
