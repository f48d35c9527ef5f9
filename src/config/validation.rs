//! Config validation: collect every problem rather than failing on the
//! first, matching the teacher's `config::validate` style.

use super::types::Config;

/// Validate `config`, returning every problem found (empty on success).
///
/// At least one listener (plain or TLS) is required, per spec.md §6.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.bouncer.listeners.is_empty() && config.bouncer.tls_listeners.is_empty() {
        errors.push("bouncer.listeners: at least one listener (plain or TLS) is required".to_string());
    }

    for (addr, tls) in &config.bouncer.tls_listeners {
        if tls.cert.trim().is_empty() {
            errors.push(format!("bouncer.tls-listeners[{addr}].cert must not be empty"));
        }
        if tls.key.trim().is_empty() {
            errors.push(format!("bouncer.tls-listeners[{addr}].key must not be empty"));
        }
    }

    if config.bouncer.storage.r#type != "redb" {
        errors.push(format!(
            "bouncer.storage.type: unsupported backend {:?} (only \"redb\" is implemented)",
            config.bouncer.storage.r#type
        ));
    }

    if config.bouncer.status_nick.trim().is_empty() {
        errors.push("bouncer.status_nick must not be empty".to_string());
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
    use crate::config::types::{BouncerConfig, StorageConfig};
    use std::collections::HashMap;

    fn base() -> Config {
        Config {
            bouncer: BouncerConfig {
                listeners: vec!["127.0.0.1:6667".parse().unwrap()],
                tls_listeners: HashMap::new(),
                storage: StorageConfig { r#type: "redb".into(), path: "bnc.redb".into() },
                logging: None,
                status_nick: "*status".into(),
                product_host: "bnc".into(),
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn no_listeners_is_rejected() {
        let mut c = base();
        c.bouncer.listeners.clear();
        let errs = validate(&c).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("at least one listener")));
    }
}
