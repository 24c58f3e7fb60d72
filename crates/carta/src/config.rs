//! TOML configuration for the whole engine.
//!
//! Every section has defaults, so an empty document is a valid configuration
//! and a partial one only overrides what it names.

use carta_core::CartaError;
use carta_core::CartaResult;
use carta_event::QueueConfig;
use carta_privacy::PrivacyPolicy;
use carta_security::SecurityPolicy;
use carta_storage::StorageConfig;
use carta_trust::TrustConfig;
use carta_url::ManagerConfig;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directive used when `RUST_LOG` is not set.
    pub log_filter: String,
    pub queue: QueueConfig,
    pub urls: ManagerConfig,
    pub storage: StorageConfig,
    pub privacy: PrivacyPolicy,
    pub security: SecurityPolicy,
    pub trust: TrustConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
            queue: QueueConfig::default(),
            urls: ManagerConfig::default(),
            storage: StorageConfig::default(),
            privacy: PrivacyPolicy::default(),
            security: SecurityPolicy::default(),
            trust: TrustConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> CartaResult<Self> {
        let config: Self = toml::from_str(text).map_err(|error| {
            CartaError::parse("config.toml_invalid", format!("invalid configuration: {error}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> CartaResult<Self> {
        let text = fs::read_to_string(path).map_err(|error| {
            CartaError::invalid_state(
                "config.read_failed",
                format!("cannot read {}: {error}", path.display()),
            )
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CartaResult<String> {
        toml::to_string_pretty(self).map_err(|error| {
            CartaError::invalid_state("config.serialize_failed", error.to_string())
        })
    }

    pub fn validate(&self) -> CartaResult<()> {
        self.queue.validate()?;
        self.urls.validate()?;
        self.storage.validate()?;
        self.privacy.validate()?;
        self.security.validate()?;
        self.trust.validate()
    }

    /// Installs the global log subscriber. False if one already existed.
    pub fn init_logging(&self) -> bool {
        carta_core::logging::init(&self.log_filter)
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;
    use carta_core::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_gives_defaults() {
        match EngineConfig::from_toml_str("") {
            Ok(config) => assert_eq!(config, EngineConfig::default()),
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn partial_sections_override_single_fields() {
        let text = r#"
log_filter = "carta_trust=debug"

[urls]
max_redirects = 5

[trust]
sitecheck_host = "sitecheck.internal"
throttle_min_secs = 60

[security]
allow_warning_bypass = false
"#;
        let config = match EngineConfig::from_toml_str(text) {
            Ok(config) => config,
            Err(error) => panic!("{error}"),
        };
        assert_eq!(config.log_filter, "carta_trust=debug");
        assert_eq!(config.urls.max_redirects, 5);
        assert_eq!(config.trust.sitecheck_host, "sitecheck.internal");
        assert_eq!(config.trust.throttle_min_secs, 60);
        assert_eq!(config.trust.throttle_max_secs, 3840);
        assert!(!config.security.allow_warning_bypass);
        assert!(config.security.fraud_protection);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("[trust]\nrequest_timeout_secs = 0\n"),
            Err(error) if error.kind == ErrorKind::Policy
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[queue]\nmax_pending_messages = \"many\"\n"),
            Err(error) if error.code == "config.toml_invalid"
        ));
    }

    #[test]
    fn serialized_form_reads_back() {
        let mut config = EngineConfig::default();
        config.trust.use_https_for_https_pages = false;
        let text = match config.to_toml_string() {
            Ok(text) => text,
            Err(error) => panic!("{error}"),
        };
        match EngineConfig::from_toml_str(&text) {
            Ok(parsed) => assert_eq!(parsed, config),
            Err(error) => panic!("{error}"),
        }
    }
}
