//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load certificate chains and private keys from files or inline PEM
//! - Build rustls server configs with the ALPN offer of a listener
//! - Attach the session resumption cache when one is configured

use std::fs::File;
use std::io::{self, BufReader, Cursor};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{NoServerSessionStorage, StoresServerSessions};
use thiserror::Error;

use crate::config::schema::TlsOptions;
use crate::net::session_cache::SessionCache;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Error type for TLS setup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificate configured")]
    MissingCertificate,

    #[error("no private key configured")]
    MissingKey,

    #[error("failed to read {what}: {source}")]
    Read {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Where a PEM document comes from.
enum PemSource<'a> {
    Inline(&'a str),
    File(&'a str),
}

impl PemSource<'_> {
    fn describe(&self) -> String {
        match self {
            PemSource::Inline(_) => "inline PEM".to_string(),
            PemSource::File(path) => path.to_string(),
        }
    }

    fn reader(&self) -> Result<Box<dyn io::BufRead + '_>, TlsError> {
        match self {
            PemSource::Inline(pem) => Ok(Box::new(Cursor::new(pem.as_bytes()))),
            PemSource::File(path) => {
                let file = File::open(path).map_err(|source| TlsError::Read {
                    what: path.to_string(),
                    source,
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
        }
    }
}

fn cert_source(opts: &TlsOptions) -> Option<PemSource<'_>> {
    match (&opts.cert_pem, &opts.cert_path) {
        (Some(pem), _) => Some(PemSource::Inline(pem)),
        (None, Some(path)) => Some(PemSource::File(path)),
        (None, None) => None,
    }
}

fn key_source(opts: &TlsOptions) -> Option<PemSource<'_>> {
    match (&opts.key_pem, &opts.key_path) {
        (Some(pem), _) => Some(PemSource::Inline(pem)),
        (None, Some(path)) => Some(PemSource::File(path)),
        (None, None) => None,
    }
}

/// Load the certificate chain configured in `opts`.
pub fn load_certs(opts: &TlsOptions) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let source = cert_source(opts).ok_or(TlsError::MissingCertificate)?;
    let mut reader = source.reader()?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Read {
            what: source.describe(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(source.describe()));
    }
    Ok(certs)
}

/// Load the private key configured in `opts`.
pub fn load_private_key(opts: &TlsOptions) -> Result<PrivateKeyDer<'static>, TlsError> {
    let source = key_source(opts).ok_or(TlsError::MissingKey)?;
    let mut reader = source.reader()?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Read {
            what: source.describe(),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(source.describe()))
}

/// Build a rustls server config.
///
/// Without a session cache, session-ID resumption is disabled.
pub fn build_server_config(
    opts: &TlsOptions,
    alpn: &[&[u8]],
    session_cache: Option<Arc<SessionCache>>,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let certs = load_certs(opts)?;
    let key = load_private_key(opts)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config.session_storage = match session_cache {
        Some(cache) => cache as Arc<dyn StoresServerSessions>,
        None => Arc::new(NoServerSessionStorage {}),
    };

    Ok(Arc::new(config))
}

/// Session cache described by `opts`, if resumption is enabled.
pub fn session_cache_for(opts: &TlsOptions) -> Option<Arc<SessionCache>> {
    opts.session_resumption_with_id.then(|| {
        Arc::new(SessionCache::new(
            opts.session_resumption_with_id_max_entries,
            opts.session_cache_time(),
        ))
    })
}

/// Combine the TLS options of two listeners sharing one socket.
///
/// Certificate material comes from the primary, or from the sibling when the
/// primary has none. Session resumption settings always follow the primary.
pub fn merge_group_options(primary: &TlsOptions, sibling: &TlsOptions) -> TlsOptions {
    let cert_owner = if primary.has_certificate() { primary } else { sibling };
    TlsOptions {
        cert_path: cert_owner.cert_path.clone(),
        key_path: cert_owner.key_path.clone(),
        cert_pem: cert_owner.cert_pem.clone(),
        key_pem: cert_owner.key_pem.clone(),
        ..primary.clone()
    }
}
