//! Third-party classification and cookie/referrer policy.

use carta_core::CartaResult;
use serde::Deserialize;
use serde::Serialize;

/// Two-label public suffixes that push the registrable domain one label left.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.jp", "ne.jp",
    "or.jp", "co.nz", "com.br", "com.cn", "co.in", "co.kr", "com.tw",
];

/// How a resource relates to the document that referred to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThirdParty {
    /// Registrable domains differ.
    pub third_party: bool,
    /// Hosts differ and neither domain-matches the other, so cookies set by
    /// one are not visible to the other.
    pub outside_reach: bool,
}

pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Registrable part of `host`; address literals are returned whole.
pub fn registrable_domain(host: &str) -> &str {
    let trimmed = host.trim_end_matches('.');
    if trimmed.starts_with('[') || trimmed.parse::<std::net::Ipv4Addr>().is_ok() {
        return trimmed;
    }

    let labels: Vec<&str> = trimmed.split('.').collect();
    if labels.len() <= 2 {
        return trimmed;
    }

    let last_two = labels[labels.len() - 2..].join(".");
    let keep = if MULTI_LABEL_SUFFIXES.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    if labels.len() <= keep {
        return trimmed;
    }

    let skip: usize = labels[..labels.len() - keep]
        .iter()
        .map(|label| label.len() + 1)
        .sum();
    &trimmed[skip..]
}

/// True when `host` equals `domain` or is a subdomain of it.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

pub fn determine_third_party(host: &str, referrer_host: &str) -> ThirdParty {
    let host = normalize_host(host);
    let referrer = normalize_host(referrer_host);
    if host.is_empty() || referrer.is_empty() || host == referrer {
        return ThirdParty::default();
    }

    ThirdParty {
        third_party: registrable_domain(&host) != registrable_domain(&referrer),
        outside_reach: !domain_matches(&host, &referrer) && !domain_matches(&referrer, &host),
    }
}

/// Global privacy policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyPolicy {
    pub block_third_party_cookies: bool,
    pub strip_referrer_cross_origin: bool,
}

impl Default for PrivacyPolicy {
    fn default() -> Self {
        Self {
            block_third_party_cookies: true,
            strip_referrer_cross_origin: true,
        }
    }
}

impl PrivacyPolicy {
    pub fn validate(&self) -> CartaResult<()> {
        Ok(())
    }

    pub fn disables_cookies(&self, relation: ThirdParty) -> bool {
        self.block_third_party_cookies && relation.third_party
    }

    pub fn sends_referrer(&self, relation: ThirdParty) -> bool {
        !(self.strip_referrer_cross_origin && relation.third_party)
    }
}
