//! Request target classification.
//!
//! # Responsibilities
//! - Recognize authority-form targets (CONNECT `host:port`)
//! - Recognize absolute-form targets (forward proxy requests)
//! - Split origin-form targets into a decoded path and query parameters
//!
//! # Design Decisions
//! - Origin-form targets are resolved against a fixed `https://domain` base,
//!   so dot segments are normalized the same way a browser would
//! - Percent-decoding is strict: a malformed escape or invalid UTF-8 keeps
//!   the path in its encoded form instead of guessing
//! - The stored path never carries the leading `/`

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use percent_encoding::percent_decode_str;
use url::Url;

const BASE_HOST: &str = "domain";

/// How the request target was understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathFormat {
    /// Origin-form, percent-decoded.
    PathDecoded,
    /// Origin-form whose pathname could not be decoded; kept encoded.
    PathNotDecoded,
    /// Not parseable as a path at all.
    PathInvalid,
    /// Absolute-form (`scheme://...`), kept verbatim.
    AbsolutePath,
    /// Authority-form (`host[:port]`), kept verbatim.
    Hostname,
}

impl PathFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathFormat::PathDecoded => "PATH_DECODED",
            PathFormat::PathNotDecoded => "PATH_NOT_DECODED",
            PathFormat::PathInvalid => "PATH_INVALID",
            PathFormat::AbsolutePath => "ABSOLUTE_PATH",
            PathFormat::Hostname => "HOSTNAME",
        }
    }
}

impl fmt::Display for PathFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered query parameters. Duplicate keys are kept in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams(Vec<(String, String)>);

impl SearchParams {
    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for SearchParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Result of classifying a request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub format: PathFormat,
    pub path: Option<String>,
    pub search_params: SearchParams,
}

impl ParsedPath {
    fn verbatim(format: PathFormat, raw: &str) -> Self {
        Self {
            format,
            path: Some(raw.to_string()),
            search_params: SearchParams::default(),
        }
    }

    fn invalid() -> Self {
        Self {
            format: PathFormat::PathInvalid,
            path: None,
            search_params: SearchParams::default(),
        }
    }
}

/// Classify a raw request target.
pub fn classify(raw: &str) -> ParsedPath {
    if is_authority(raw) {
        return ParsedPath::verbatim(PathFormat::Hostname, raw);
    }
    if is_absolute_uri(raw) {
        return ParsedPath::verbatim(PathFormat::AbsolutePath, raw);
    }
    // Only origin-form targets are resolved against the base. A relative
    // token such as the asterisk-form `*` is not, and stays invalid.
    if !raw.starts_with('/') {
        return ParsedPath::invalid();
    }

    let url = match Url::parse(&format!("https://{BASE_HOST}{raw}")) {
        Ok(url) if url.host_str() == Some(BASE_HOST) => url,
        _ => return ParsedPath::invalid(),
    };

    let encoded = url.path();
    let stripped = |p: &str| p.strip_prefix('/').unwrap_or(p).to_string();
    let (format, path) = match strict_decode(encoded) {
        Some(decoded) => (PathFormat::PathDecoded, stripped(&decoded)),
        None => (PathFormat::PathNotDecoded, stripped(encoded)),
    };

    ParsedPath {
        format,
        path: Some(path),
        search_params: url.query_pairs().into_owned().collect(),
    }
}

/// Percent-decode, failing on malformed escapes or invalid UTF-8.
fn strict_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_decode_str(input).decode_utf8().ok().map(|s| s.into_owned())
}

/// `host[:port]` where host is a registered name, IPv4 or bracketed IPv6.
fn is_authority(raw: &str) -> bool {
    if let Some(rest) = raw.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return false;
        };
        if host.parse::<Ipv6Addr>().is_err() {
            return false;
        }
        return match tail {
            "" => true,
            _ => tail.strip_prefix(':').is_some_and(is_port),
        };
    }

    let (host, port) = match raw.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (raw, None),
    };
    if port.is_some_and(|p| !is_port(p)) {
        return false;
    }
    host.parse::<Ipv4Addr>().is_ok() || is_reg_name(host)
}

fn is_port(port: &str) -> bool {
    !port.is_empty() && port.len() <= 5 && port.parse::<u16>().is_ok()
}

fn is_reg_name(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// `scheme://...` per RFC 3986 scheme grammar.
fn is_absolute_uri(raw: &str) -> bool {
    let Some((scheme, _)) = raw.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
