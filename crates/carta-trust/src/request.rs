//! Sitecheck request URLs.

use crate::TrustConfig;
use crate::hash::calculate_md5_hash;
use percent_encoding::NON_ALPHANUMERIC;
use percent_encoding::utf8_percent_encode;

/// Appended to the host before hashing.
pub const HASH_SUFFIX: &str = "-Oscar0308";

fn base(config: &TrustConfig, secure: bool, info_page: bool) -> String {
    let scheme = if secure && config.use_https_for_https_pages {
        "https"
    } else {
        "http"
    };
    let path = if info_page { "info/" } else { "" };
    format!("{scheme}://{}/{path}", config.sitecheck_host.trim())
}

fn host_query(host: &str) -> String {
    let mut salted = String::with_capacity(host.len() + HASH_SUFFIX.len());
    salted.push_str(host);
    salted.push_str(HASH_SUFFIX);
    format!("?host={host}&hdn={}", calculate_md5_hash(&salted, true))
}

/// Machine-readable check for `host`. `secure` tells whether the page being
/// checked was loaded over HTTPS.
pub fn check_url(config: &TrustConfig, host: &str, secure: bool) -> String {
    let mut url = base(config, secure, false);
    url.push_str(&host_query(host));
    url
}

/// Human-readable result page for `site` on `host`.
pub fn info_url(config: &TrustConfig, host: &str, secure: bool, site: &str) -> String {
    let mut url = base(config, secure, true);
    url.push_str(&host_query(host));
    url.push_str("&site=");
    url.extend(utf8_percent_encode(site, NON_ALPHANUMERIC));
    url
}

#[cfg(test)]
mod tests {
    use super::check_url;
    use super::info_url;
    use crate::TrustConfig;

    #[test]
    fn check_url_is_bit_exact() {
        let config = TrustConfig::default();
        assert_eq!(
            check_url(&config, "example.com", true),
            "https://sitecheck2.opera.com/?host=example.com&hdn=9biEkge8/fJVkhS0baEnZw=="
        );
        assert_eq!(
            check_url(&config, "host2.example", false),
            "http://sitecheck2.opera.com/?host=host2.example&hdn=h9khJ7l%2Bhcj8oaEEaFnaZQ=="
        );
    }

    #[test]
    fn https_can_be_turned_off() {
        let config = TrustConfig {
            use_https_for_https_pages: false,
            ..TrustConfig::default()
        };
        assert!(check_url(&config, "example.com", true).starts_with("http://"));
    }

    #[test]
    fn info_url_carries_the_site() {
        let config = TrustConfig::default();
        assert_eq!(
            info_url(&config, "example.com", false, "http://example.com/a?b=1"),
            "http://sitecheck2.opera.com/info/?host=example.com&hdn=9biEkge8/fJVkhS0baEnZw==\
             &site=http%3A%2F%2Fexample%2Ecom%2Fa%3Fb%3D1"
        );
    }
}
