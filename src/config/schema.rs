//! Configuration schema definitions.
//!
//! This module defines the listener set a server is built from, plus the
//! process-level settings the binary reads from its config file.
//! All types derive Serde traits for deserialization from config files.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the server binary.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Logging settings.
    pub logging: LoggingConfig,

    /// Shutdown settings.
    pub shutdown: ShutdownConfig,

    /// Metrics exporter settings.
    pub metrics: MetricsConfig,

    /// Listener instances, in declaration order.
    pub listeners: Vec<ListenerSpec>,
}

/// Protocol served by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Plain HTTP/1.1.
    Http,
    /// HTTP/1.1 over TLS.
    Https,
    /// HTTP/2 over TLS.
    Http2,
    /// Accepted by the parser, rejected by validation.
    Http3,
}

impl ListenerMode {
    /// Whether this mode terminates TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, ListenerMode::Https | ListenerMode::Http2)
    }
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerMode::Http => "http",
            ListenerMode::Https => "https",
            ListenerMode::Http2 => "http2",
            ListenerMode::Http3 => "http3",
        };
        f.write_str(name)
    }
}

/// One listener instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerSpec {
    /// Label reported on every request from this listener.
    #[serde(default)]
    pub listener_id: Option<String>,

    pub mode: ListenerMode,

    /// IP address to bind, e.g. "127.0.0.1" or "::".
    pub bind_address: String,

    /// Port to bind. 0 picks an ephemeral port.
    pub bind_port: u16,

    #[serde(default)]
    pub options: TransportOptions,
}

impl ListenerSpec {
    /// Plain HTTP/1.1 listener with default options.
    pub fn http(bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            listener_id: None,
            mode: ListenerMode::Http,
            bind_address: bind_address.into(),
            bind_port,
            options: TransportOptions::default(),
        }
    }

    /// TLS listener of the given mode.
    pub fn tls(mode: ListenerMode, bind_address: impl Into<String>, bind_port: u16, tls: TlsOptions) -> Self {
        Self {
            listener_id: None,
            mode,
            bind_address: bind_address.into(),
            bind_port,
            options: TransportOptions {
                tls: Some(tls),
                ..TransportOptions::default()
            },
        }
    }

    /// Set the listener ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.listener_id = Some(id.into());
        self
    }

    /// Key shared by listeners bound to the same address and port.
    ///
    /// IP literals are compared in canonical form, so `::1` and
    /// `0:0:0:0:0:0:0:1` land in one group.
    pub fn group_key(&self) -> String {
        match self.bind_address.parse::<IpAddr>() {
            Ok(ip) => format!("[{ip}]:{}", self.bind_port),
            Err(_) => format!("[{}]:{}", self.bind_address, self.bind_port),
        }
    }
}

/// Protocol-specific options of a listener.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportOptions {
    /// Required for `https` and `http2`.
    pub tls: Option<TlsOptions>,

    pub http1: Http1Options,

    pub http2: Http2Options,
}

/// TLS material and session resumption settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Path to certificate chain file (PEM).
    pub cert_path: Option<String>,

    /// Path to private key file (PEM).
    pub key_path: Option<String>,

    /// Inline certificate chain (PEM). Takes precedence over `cert_path`.
    pub cert_pem: Option<String>,

    /// Inline private key (PEM). Takes precedence over `key_path`.
    pub key_pem: Option<String>,

    /// Keep a server-side session cache for ID-based resumption.
    pub session_resumption_with_id: bool,

    pub session_resumption_with_id_max_entries: usize,

    pub session_resumption_with_id_cache_time_ms: u64,
}

impl TlsOptions {
    /// Options with inline PEM material and defaults for everything else.
    pub fn from_pem(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: Some(cert_pem.into()),
            key_pem: Some(key_pem.into()),
            ..Self::default()
        }
    }

    /// Whether a certificate and a key are both configured.
    pub fn has_certificate(&self) -> bool {
        (self.cert_pem.is_some() || self.cert_path.is_some())
            && (self.key_pem.is_some() || self.key_path.is_some())
    }

    pub fn session_cache_time(&self) -> Duration {
        Duration::from_millis(self.session_resumption_with_id_cache_time_ms)
    }
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            cert_pem: None,
            key_pem: None,
            session_resumption_with_id: false,
            session_resumption_with_id_max_entries: 1_000_000,
            session_resumption_with_id_cache_time_ms: 3_600_000,
        }
    }
}

/// HTTP/1.1 connection options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http1Options {
    pub keep_alive: bool,

    /// Keep the connection open after the client half-closes its side.
    pub half_close: bool,
}

impl Default for Http1Options {
    fn default() -> Self {
        Self {
            keep_alive: true,
            half_close: false,
        }
    }
}

/// HTTP/2 connection options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http2Options {
    /// Accept extended CONNECT (`:protocol`), e.g. WebSocket over HTTP/2.
    pub enable_connect_protocol: bool,

    pub max_concurrent_streams: u32,

    pub initial_window_size: Option<u32>,
}

impl Default for Http2Options {
    fn default() -> Self {
        Self {
            enable_connect_protocol: true,
            max_concurrent_streams: 1000,
            initial_window_size: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "unified_http_server=info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
}

/// Shutdown behaviour of the binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long graceful close may take before falling back to destroy.
    pub grace_period_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_period_secs: 30 }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    /// Scrape endpoint address, e.g. "127.0.0.1:9090". Disabled when unset.
    pub address: Option<String>,
}
