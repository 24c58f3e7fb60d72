//! Site reputation checks against the sitecheck service.
//!
//! A [`TrustCheckManager`] decides, for each navigation, whether the cached
//! rating of the target host can be used or a new check must be fetched. Checks
//! are batched per host in a [`ServerTrustChecker`], whose XML answer is read by
//! a [`TrustInfoParser`] and merged into the shared host entry.

pub mod checker;
pub mod hash;
pub mod manager;
pub mod normalize;
pub mod parser;
pub mod request;
pub mod throttle;
pub mod xml;

use carta_core::CartaError;
use carta_core::CartaResult;
use serde::Deserialize;
use serde::Serialize;

pub use checker::CheckContext;
pub use checker::CheckOutcome;
pub use checker::CheckState;
pub use checker::CheckerId;
pub use checker::ServerTrustChecker;
pub use hash::calculate_md5_hash;
pub use manager::TrustCheckManager;
pub use manager::TrustDecision;
pub use manager::TrustVerdict;
pub use manager::WARNING_PAGE_URL;
pub use normalize::NormalizedUrl;
pub use normalize::normalize_url;
pub use parser::TrustInfo;
pub use parser::TrustInfoParser;
pub use throttle::RequestThrottler;

const DEFAULT_SITECHECK_HOST: &str = "sitecheck2.opera.com";
const DEFAULT_REQUEST_TIMEOUT_SECS: u32 = 30;
const DEFAULT_CLIENT_EXPIRY_SECS: u64 = 24 * 60 * 60;
const DEFAULT_THROTTLE_MIN_SECS: u64 = 4 * 60;
const DEFAULT_THROTTLE_MAX_SECS: u64 = 64 * 60;

/// Reputation service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub sitecheck_host: String,
    pub request_timeout_secs: u32,
    /// Ask over HTTPS when the page being checked is itself HTTPS.
    pub use_https_for_https_pages: bool,
    /// Resolve the checked host first so local addresses are never sent out.
    pub resolve_before_check: bool,
    /// Lifetime of a verdict whose answer carried no `<ce>` element.
    pub default_client_expiry_secs: u64,
    pub throttle_min_secs: u64,
    pub throttle_max_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            sitecheck_host: DEFAULT_SITECHECK_HOST.to_owned(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            use_https_for_https_pages: true,
            resolve_before_check: true,
            default_client_expiry_secs: DEFAULT_CLIENT_EXPIRY_SECS,
            throttle_min_secs: DEFAULT_THROTTLE_MIN_SECS,
            throttle_max_secs: DEFAULT_THROTTLE_MAX_SECS,
        }
    }
}

impl TrustConfig {
    pub fn validate(&self) -> CartaResult<()> {
        let host = self.sitecheck_host.trim();
        if host.is_empty() || host.contains(['/', '?', '#', ' ']) {
            return Err(CartaError::policy(
                "trust.config.host_invalid",
                format!("`{}` is not a usable sitecheck host", self.sitecheck_host),
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(CartaError::policy(
                "trust.config.timeout_invalid",
                "request_timeout_secs must be greater than zero",
            ));
        }

        if self.throttle_min_secs == 0 || self.throttle_max_secs < self.throttle_min_secs {
            return Err(CartaError::policy(
                "trust.config.throttle_invalid",
                format!(
                    "throttle window {}..{} is empty",
                    self.throttle_min_secs, self.throttle_max_secs
                ),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TrustConfig;

    #[test]
    fn default_config_is_valid() {
        let config = TrustConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.throttle_min_secs, 240);
        assert_eq!(config.throttle_max_secs, 3840);
    }

    #[test]
    fn rejects_unusable_values() {
        let host = TrustConfig {
            sitecheck_host: "sitecheck.test/path".to_owned(),
            ..TrustConfig::default()
        };
        assert!(matches!(
            host.validate(),
            Err(error) if error.code == "trust.config.host_invalid"
        ));

        let timeout = TrustConfig {
            request_timeout_secs: 0,
            ..TrustConfig::default()
        };
        assert!(matches!(
            timeout.validate(),
            Err(error) if error.code == "trust.config.timeout_invalid"
        ));

        let throttle = TrustConfig {
            throttle_min_secs: 600,
            throttle_max_secs: 60,
            ..TrustConfig::default()
        };
        assert!(matches!(
            throttle.validate(),
            Err(error) if error.code == "trust.config.throttle_invalid"
        ));
    }
}
