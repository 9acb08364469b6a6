//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation of a listener set (serde handles syntactic)
//! - Reject modes this server does not implement
//! - Check every TLS socket has certificate material, from either listener
//!   sharing it
//! - Check listeners sharing an address:port form a valid TLS group
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: &[ListenerSpec] → Result<(), Vec<ValidationError>>
//! - Runs before a server is constructed

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::config::schema::{ListenerMode, ListenerSpec};

/// A single semantic problem in a listener set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener {index}: mode '{mode}' is not supported")]
    UnsupportedMode { index: usize, mode: ListenerMode },

    #[error("listener {index}: mode '{mode}' requires tls.cert and tls.key on it or its TLS sibling")]
    MissingCertificate { index: usize, mode: ListenerMode },

    #[error("listener {index}: bind_address is empty")]
    EmptyBindAddress { index: usize },

    #[error("listener {index}: bind_address '{address}' is not an IP address")]
    InvalidBindAddress { index: usize, address: String },

    #[error("listener {index}: session resumption needs a non-zero {field}")]
    InvalidSessionCache { index: usize, field: &'static str },

    #[error("listener {index}: {key} is already used by listener {first} with mode '{mode}'")]
    DuplicateMode {
        index: usize,
        first: usize,
        key: String,
        mode: ListenerMode,
    },

    #[error("listener {index}: {key} is already shared by two TLS listeners")]
    GroupFull { index: usize, key: String },

    #[error("listener {index}: {key} is already bound by a listener of a different transport")]
    MixedTransport { index: usize, key: String },
}

/// Validate a listener set.
pub fn validate_listeners(listeners: &[ListenerSpec]) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    // key → indices of listeners already seen on it
    let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
    // Sockets whose TLS options include a certificate.
    let certified: HashSet<String> = listeners
        .iter()
        .filter(|spec| spec.mode.is_tls())
        .filter(|spec| spec.options.tls.as_ref().is_some_and(|tls| tls.has_certificate()))
        .map(ListenerSpec::group_key)
        .collect();

    for (index, spec) in listeners.iter().enumerate() {
        if spec.mode == ListenerMode::Http3 {
            errors.push(ValidationError::UnsupportedMode { index, mode: spec.mode });
            continue;
        }

        if spec.bind_address.trim().is_empty() {
            errors.push(ValidationError::EmptyBindAddress { index });
        } else if spec.bind_address.parse::<std::net::IpAddr>().is_err() {
            errors.push(ValidationError::InvalidBindAddress {
                index,
                address: spec.bind_address.clone(),
            });
        }

        if spec.mode.is_tls() {
            if !certified.contains(&spec.group_key()) {
                errors.push(ValidationError::MissingCertificate { index, mode: spec.mode });
            }
            if let Some(tls) = spec.options.tls.as_ref().filter(|tls| tls.session_resumption_with_id) {
                if tls.session_resumption_with_id_max_entries == 0 {
                    errors.push(ValidationError::InvalidSessionCache {
                        index,
                        field: "session_resumption_with_id_max_entries",
                    });
                }
                if tls.session_resumption_with_id_cache_time_ms == 0 {
                    errors.push(ValidationError::InvalidSessionCache {
                        index,
                        field: "session_resumption_with_id_cache_time_ms",
                    });
                }
            }
        }

        // A plain listener on port 0 always gets its own ephemeral port.
        if spec.bind_port == 0 && !spec.mode.is_tls() {
            continue;
        }
        let key = spec.group_key();
        let seen = by_key.entry(key.clone()).or_default();
        if let Some(error) = check_group(listeners, seen, index, &key) {
            errors.push(error);
        }
        seen.push(index);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_group(
    listeners: &[ListenerSpec],
    seen: &[usize],
    index: usize,
    key: &str,
) -> Option<ValidationError> {
    let spec = &listeners[index];
    let first = *seen.first()?;

    if !spec.mode.is_tls() || seen.iter().any(|&i| !listeners[i].mode.is_tls()) {
        return Some(ValidationError::MixedTransport {
            index,
            key: key.to_string(),
        });
    }
    if seen.len() >= 2 {
        return Some(ValidationError::GroupFull {
            index,
            key: key.to_string(),
        });
    }
    if listeners[first].mode == spec.mode {
        return Some(ValidationError::DuplicateMode {
            index,
            first,
            key: key.to_string(),
            mode: spec.mode,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsOptions;

    fn tls(mode: ListenerMode, port: u16) -> ListenerSpec {
        ListenerSpec::tls(mode, "127.0.0.1", port, TlsOptions::from_pem("cert", "key"))
    }

    #[test]
    fn accepts_shared_tls_pair() {
        let listeners = vec![
            tls(ListenerMode::Https, 8443),
            tls(ListenerMode::Http2, 8443),
            ListenerSpec::http("127.0.0.1", 8080),
        ];
        assert!(validate_listeners(&listeners).is_ok());
    }

    #[test]
    fn rejects_http3() {
        let mut spec = ListenerSpec::http("127.0.0.1", 443);
        spec.mode = ListenerMode::Http3;
        let errors = validate_listeners(&[spec]).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::UnsupportedMode { index: 0, mode: ListenerMode::Http3 }]
        );
    }

    #[test]
    fn collects_every_error() {
        let mut no_cert = tls(ListenerMode::Https, 9443);
        no_cert.options.tls = None;
        let mut bad_addr = ListenerSpec::http("", 8080);
        bad_addr.listener_id = Some("empty".into());

        let errors = validate_listeners(&[no_cert, bad_addr]).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], ValidationError::MissingCertificate { index: 0, .. }));
        assert!(matches!(errors[1], ValidationError::EmptyBindAddress { index: 1 }));
    }

    #[test]
    fn rejects_bad_groups() {
        let same_mode = vec![tls(ListenerMode::Https, 8443), tls(ListenerMode::Https, 8443)];
        let errors = validate_listeners(&same_mode).unwrap_err();
        assert!(matches!(errors[0], ValidationError::DuplicateMode { index: 1, first: 0, .. }));

        let three = vec![
            tls(ListenerMode::Https, 8443),
            tls(ListenerMode::Http2, 8443),
            tls(ListenerMode::Http2, 8443),
        ];
        let errors = validate_listeners(&three).unwrap_err();
        assert!(matches!(errors[0], ValidationError::GroupFull { index: 2, .. }));

        let mixed = vec![ListenerSpec::http("127.0.0.1", 8443), tls(ListenerMode::Http2, 8443)];
        let errors = validate_listeners(&mixed).unwrap_err();
        assert!(matches!(errors[0], ValidationError::MixedTransport { index: 1, .. }));
    }

    #[test]
    fn ephemeral_plain_listeners_never_conflict() {
        let listeners = vec![
            ListenerSpec::http("127.0.0.1", 0),
            ListenerSpec::http("127.0.0.1", 0),
            tls(ListenerMode::Https, 0),
            tls(ListenerMode::Http2, 0),
        ];
        assert!(validate_listeners(&listeners).is_ok());

        let listeners = vec![tls(ListenerMode::Https, 0), tls(ListenerMode::Https, 0)];
        assert!(validate_listeners(&listeners).is_err());
    }

    #[test]
    fn rejects_zero_sized_session_cache() {
        let mut spec = tls(ListenerMode::Https, 8443);
        let options = spec.options.tls.as_mut().unwrap();
        options.session_resumption_with_id = true;
        options.session_resumption_with_id_max_entries = 0;

        let errors = validate_listeners(&[spec]).unwrap_err();
        assert!(matches!(errors[0], ValidationError::InvalidSessionCache { index: 0, .. }));
    }

    #[test]
    fn sibling_certificate_covers_the_group() {
        let mut bare = tls(ListenerMode::Https, 8443);
        bare.options.tls = None;
        let listeners = vec![bare, tls(ListenerMode::Http2, 8443)];
        assert!(validate_listeners(&listeners).is_ok());

        let mut alone = tls(ListenerMode::Https, 9443);
        alone.options.tls = None;
        let listeners = vec![alone, tls(ListenerMode::Http2, 8443)];
        let errors = validate_listeners(&listeners).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::MissingCertificate { index: 0, mode: ListenerMode::Https }]
        );
    }

    #[test]
    fn equivalent_addresses_share_a_group() {
        let mut long_form = tls(ListenerMode::Http2, 8443);
        long_form.bind_address = "0:0:0:0:0:0:0:1".into();
        let mut short_form = tls(ListenerMode::Https, 8443);
        short_form.bind_address = "::1".into();
        assert!(validate_listeners(&[short_form.clone(), long_form]).is_ok());

        let mut same_mode = tls(ListenerMode::Https, 8443);
        same_mode.bind_address = "0:0:0:0:0:0:0:1".into();
        let errors = validate_listeners(&[short_form, same_mode]).unwrap_err();
        assert!(matches!(errors[0], ValidationError::DuplicateMode { index: 1, first: 0, .. }));
    }
}
