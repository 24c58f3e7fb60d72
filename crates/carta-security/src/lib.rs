//! Trust ratings, fraud advisories and the per-host blacklist.

use carta_core::CartaError;
use carta_core::CartaResult;
use regex::Regex;
use regex::RegexBuilder;
use serde::Deserialize;
use serde::Serialize;

const DEFAULT_MAX_PATTERN_BYTES: usize = 4 * 1024;
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Cumulative reputation of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrustRating {
    #[default]
    NotSet,
    /// A check was attempted and gave no answer, or the host is local.
    UnknownTrust,
    /// The reputation service has nothing against the host.
    NoFraud,
    /// Some URLs on the host are listed; each URL must be matched.
    UntrustedAskAdvisory,
    Phishing,
    Malware,
}

impl TrustRating {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSet => "not_set",
            Self::UnknownTrust => "unknown",
            Self::NoFraud => "no_fraud",
            Self::UntrustedAskAdvisory => "ask_advisory",
            Self::Phishing => "phishing",
            Self::Malware => "malware",
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::NotSet => 0,
            Self::UnknownTrust => 1,
            Self::NoFraud => 2,
            Self::UntrustedAskAdvisory => 3,
            Self::Phishing => 4,
            Self::Malware => 5,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::UnknownTrust,
            2 => Self::NoFraud,
            3 => Self::UntrustedAskAdvisory,
            4 => Self::Phishing,
            5 => Self::Malware,
            _ => Self::NotSet,
        }
    }

    /// Ratings that put a warning page in front of the document.
    pub fn is_fraud(self) -> bool {
        matches!(self, Self::Phishing | Self::Malware)
    }
}

/// Advisory category announced by the reputation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FraudType {
    Malware,
    Phishing,
    Other(u32),
}

impl FraudType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Malware,
            2 => Self::Phishing,
            other => Self::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Malware => 1,
            Self::Phishing => 2,
            Self::Other(value) => value,
        }
    }

    /// Rating a matched URL gets. Other advisory types carry no verdict.
    pub fn rating(self) -> TrustRating {
        match self {
            Self::Malware => TrustRating::Malware,
            Self::Phishing => TrustRating::Phishing,
            Self::Other(_) => TrustRating::UnknownTrust,
        }
    }
}

/// Descriptive record joined to blacklist entries through `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub id: u32,
    pub fraud_type: FraudType,
    pub homepage: String,
    pub advisory_url: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Literal,
    Regex,
}

/// Result of a blacklist lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FraudMatch {
    pub source_id: u32,
    pub kind: MatchKind,
}

#[derive(Debug, Clone)]
struct FraudRegex {
    pattern: String,
    regex: Regex,
    source_id: u32,
}

/// Listed URLs, patterns and advisories for one host.
///
/// Lookups try literal URLs first, then each pattern in registration order;
/// the first hit wins.
#[derive(Debug, Clone, Default)]
pub struct FraudList {
    urls: Vec<(String, u32)>,
    regexes: Vec<FraudRegex>,
    advisories: Vec<Advisory>,
}

impl FraudList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.regexes.is_empty()
    }

    pub fn url_count(&self) -> usize {
        self.urls.len()
    }

    pub fn regex_count(&self) -> usize {
        self.regexes.len()
    }

    pub fn add_url(&mut self, url: &str, source_id: u32) {
        if !self.urls.iter().any(|(listed, _)| listed == url) {
            self.urls.push((url.to_owned(), source_id));
        }
    }

    pub fn add_regex(&mut self, pattern: &str, source_id: u32) -> CartaResult<()> {
        self.add_regex_with_limit(pattern, source_id, DEFAULT_MAX_PATTERN_BYTES)
    }

    pub fn add_regex_with_limit(
        &mut self,
        pattern: &str,
        source_id: u32,
        max_pattern_bytes: usize,
    ) -> CartaResult<()> {
        if pattern.len() > max_pattern_bytes {
            return Err(CartaError::parse(
                "security.fraud.pattern_too_long",
                format!(
                    "blacklist pattern exceeds {max_pattern_bytes} bytes ({})",
                    pattern.len()
                ),
            ));
        }

        if self.regexes.iter().any(|entry| entry.pattern == pattern) {
            return Ok(());
        }

        let regex = RegexBuilder::new(pattern)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|error| {
                CartaError::parse(
                    "security.fraud.pattern_invalid",
                    format!("invalid blacklist pattern `{pattern}`: {error}"),
                )
            })?;

        self.regexes.push(FraudRegex {
            pattern: pattern.to_owned(),
            regex,
            source_id,
        });
        Ok(())
    }

    /// Adds or replaces the advisory with the same id.
    pub fn add_advisory(&mut self, advisory: Advisory) {
        if let Some(existing) = self
            .advisories
            .iter_mut()
            .find(|existing| existing.id == advisory.id)
        {
            *existing = advisory;
        } else {
            self.advisories.push(advisory);
        }
    }

    pub fn advisory(&self, id: u32) -> Option<&Advisory> {
        self.advisories.iter().find(|advisory| advisory.id == id)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.regexes.iter().map(|entry| entry.pattern.as_str())
    }

    pub fn is_url_listed(&self, url: &str) -> Option<u32> {
        self.urls
            .iter()
            .find(|(listed, _)| listed == url)
            .map(|(_, source_id)| *source_id)
    }

    pub fn match_url(&self, url: &str) -> Option<FraudMatch> {
        if let Some(source_id) = self.is_url_listed(url) {
            return Some(FraudMatch {
                source_id,
                kind: MatchKind::Literal,
            });
        }

        self.regexes
            .iter()
            .find(|entry| entry.regex.is_match(url))
            .map(|entry| FraudMatch {
                source_id: entry.source_id,
                kind: MatchKind::Regex,
            })
    }

    /// Appends entries from `other`, keeping registration order.
    pub fn merge(&mut self, other: FraudList) {
        for (url, source_id) in other.urls {
            self.add_url(&url, source_id);
        }
        for entry in other.regexes {
            if !self
                .regexes
                .iter()
                .any(|existing| existing.pattern == entry.pattern)
            {
                self.regexes.push(entry);
            }
        }
        for advisory in other.advisories {
            self.add_advisory(advisory);
        }
    }
}

/// Connection security level recorded on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Unknown,
}

impl SecurityLevel {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Unknown => 4,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            4 => Self::Unknown,
            _ => Self::None,
        }
    }
}

/// Fraud protection switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub fraud_protection: bool,
    /// Lets the user click through a warning page for the rest of the session.
    pub allow_warning_bypass: bool,
    pub max_pattern_bytes: usize,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            fraud_protection: true,
            allow_warning_bypass: true,
            max_pattern_bytes: DEFAULT_MAX_PATTERN_BYTES,
        }
    }
}

impl SecurityPolicy {
    pub fn validate(&self) -> CartaResult<()> {
        if self.max_pattern_bytes == 0 {
            return Err(CartaError::policy(
                "security.invalid_policy",
                "max_pattern_bytes must be greater than zero",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Advisory;
    use super::FraudList;
    use super::FraudMatch;
    use super::FraudType;
    use super::MatchKind;
    use super::SecurityPolicy;
    use super::TrustRating;
    use pretty_assertions::assert_eq;

    fn advisory(id: u32, fraud_type: FraudType) -> Advisory {
        Advisory {
            id,
            fraud_type,
            homepage: "http://a".to_owned(),
            advisory_url: "http://b".to_owned(),
            text: "Bad site".to_owned(),
        }
    }

    #[test]
    fn literal_match_wins_over_regex() {
        let mut list = FraudList::new();
        assert!(list.add_regex("evil\\.example\\.com/.*", 1).is_ok());
        list.add_url("evil.example.com/login", 2);

        assert_eq!(
            list.match_url("evil.example.com/login"),
            Some(FraudMatch {
                source_id: 2,
                kind: MatchKind::Literal
            })
        );
        assert_eq!(
            list.match_url("evil.example.com/other"),
            Some(FraudMatch {
                source_id: 1,
                kind: MatchKind::Regex
            })
        );
    }

    #[test]
    fn regexes_match_in_registration_order() {
        let mut list = FraudList::new();
        assert!(list.add_regex("a\\.test/x.*", 10).is_ok());
        assert!(list.add_regex("a\\.test/.*", 20).is_ok());
        assert_eq!(
            list.match_url("a.test/xyz").map(|found| found.source_id),
            Some(10)
        );
        assert_eq!(
            list.match_url("a.test/abc").map(|found| found.source_id),
            Some(20)
        );
        assert_eq!(list.match_url("b.test/"), None);
    }

    #[test]
    fn invalid_pattern_is_a_parse_error() {
        let mut list = FraudList::new();
        let result = list.add_regex("(unclosed", 1);
        if let Err(error) = result {
            assert_eq!(error.code, "security.fraud.pattern_invalid");
        } else {
            panic!("expected invalid pattern");
        }
        assert!(list.is_empty());
    }

    #[test]
    fn advisory_is_joined_by_id() {
        let mut list = FraudList::new();
        list.add_advisory(advisory(7, FraudType::from_u32(2)));
        let found = list.advisory(7).map(|entry| entry.fraud_type.rating());
        assert_eq!(found, Some(TrustRating::Phishing));
        assert!(list.advisory(8).is_none());
    }

    #[test]
    fn merge_keeps_order_and_skips_duplicates() {
        let mut base = FraudList::new();
        base.add_url("x.test/1", 1);
        let mut update = FraudList::new();
        update.add_url("x.test/1", 1);
        update.add_url("x.test/2", 2);
        assert!(update.add_regex("x\\.test/3.*", 3).is_ok());
        update.add_advisory(advisory(2, FraudType::Malware));

        base.merge(update);
        assert_eq!(base.url_count(), 2);
        assert_eq!(base.regex_count(), 1);
        assert_eq!(
            base.advisory(2).map(|entry| entry.fraud_type.rating()),
            Some(TrustRating::Malware)
        );
    }

    #[test]
    fn rating_round_trips_through_u32() {
        for rating in [
            TrustRating::NotSet,
            TrustRating::UnknownTrust,
            TrustRating::NoFraud,
            TrustRating::UntrustedAskAdvisory,
            TrustRating::Phishing,
            TrustRating::Malware,
        ] {
            assert_eq!(TrustRating::from_u32(rating.to_u32()), rating);
        }
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(SecurityPolicy::default().validate().is_ok());
        let policy = SecurityPolicy {
            max_pattern_bytes: 0,
            ..SecurityPolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
