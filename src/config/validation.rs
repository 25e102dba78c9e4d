//! Configuration validation.
//!
//! Serde handles the syntax; this pass checks what serde can't: at least one
//! backend, unique names, and base URLs the forwarder can actually use.
//! Returns all validation errors, not just the first.

use std::collections::HashSet;

use crate::config::schema::ProxyConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("at least one backend must be configured")]
    NoBackends,

    #[error("backend #{index} has an empty name")]
    EmptyName { index: usize },

    #[error("backend name '{0}' is used more than once")]
    DuplicateName(String),

    #[error("backend '{name}' has an invalid base_url: {reason}")]
    InvalidBaseUrl { name: String, reason: String },

    #[error("backend '{name}' uses unsupported scheme '{scheme}' (expected http or https)")]
    UnsupportedScheme { name: String, scheme: String },
}

/// Semantic checks over a normalized config.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.backends.is_empty() {
        errors.push(ValidationError::NoBackends);
    }

    let mut seen = HashSet::new();
    for (index, backend) in config.backends.iter().enumerate() {
        if backend.name.trim().is_empty() {
            errors.push(ValidationError::EmptyName { index });
        } else if !seen.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateName(backend.name.clone()));
        }

        match url::Url::parse(&backend.base_url) {
            Ok(url) if !matches!(url.scheme(), "http" | "https") => {
                errors.push(ValidationError::UnsupportedScheme {
                    name: backend.name.clone(),
                    scheme: url.scheme().to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidBaseUrl {
                name: backend.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackendConfig, Platform};

    fn backend(name: &str, base_url: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            base_url: base_url.to_string(),
            token: String::new(),
            enabled: true,
            model: None,
            platform: Platform::Anthropic,
        }
    }

    #[test]
    fn empty_backend_list_is_rejected() {
        let errors = validate_config(&ProxyConfig::default()).unwrap_err();
        assert_eq!(errors, vec![ValidationError::NoBackends]);
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.backends = vec![
            backend("a", "http://127.0.0.1:1"),
            backend("a", "not a url"),
            backend("", "ftp://example.com"),
        ];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::DuplicateName("a".into())));
        assert!(errors.contains(&ValidationError::EmptyName { index: 2 }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnsupportedScheme { scheme, .. } if scheme == "ftp")));
    }

    #[test]
    fn prefixed_https_base_url_is_fine() {
        let mut config = ProxyConfig::default();
        config.backends = vec![backend("a", "https://relay.example.com/api/anthropic")];
        assert!(validate_config(&config).is_ok());
    }
}
