//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → adapter.rs (hyper HTTP/1.1 or HTTP/2 connection, per-request dispatch)
//!     → request.rs (NormalizedRequest: head, classified path, body, responder)
//!     → path.rs (request target classification)
//!     → request handler
//!     → response.rs / tunnel.rs (single response, or tunnel bytes)
//!     → Send to client
//! ```

pub mod adapter;
pub mod body;
pub mod path;
pub mod request;
pub mod response;
pub mod tunnel;

pub use adapter::{RequestListener, SharedListener};
pub use body::{BodyError, BodyStream, ResponseBody};
pub use path::{PathFormat, SearchParams};
pub use request::{NormalizedRequest, RequestHead, Transport};
pub use response::{RespondError, ResponseHead, ResponseInit};
