//! Canonical `host/path` form used for blacklist lookups.

use carta_url::Handle;
use carta_url::PathVariant;

/// Host and path after normalization. `host` carries a non-default port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub host: String,
    pub path: String,
}

impl NormalizedUrl {
    /// The `host/path` string blacklist entries are compared with.
    pub fn key(&self) -> String {
        let mut key = String::with_capacity(self.host.len() + self.path.len());
        key.push_str(&self.host);
        key.push_str(&self.path);
        key
    }
}

/// Normalizes a host and path.
///
/// Steps run in a fixed order: lower-case, drop trailing dots from the host,
/// cut the path at `?` or `#`, collapse repeated slashes, then append `port`
/// unless it is the scheme default.
pub fn normalize_url(
    host: &str,
    port: Option<u16>,
    default_port: Option<u16>,
    path: &str,
) -> NormalizedUrl {
    let mut host = host.to_lowercase();
    let path = path.to_lowercase();

    let trimmed = host.trim_end_matches('.').len();
    host.truncate(trimmed);

    let path = match path.find(['?', '#']) {
        Some(end) => &path[..end],
        None => path.as_str(),
    };

    let mut collapsed = String::with_capacity(path.len() + 1);
    for ch in path.chars() {
        if ch == '/' && collapsed.ends_with('/') {
            continue;
        }
        collapsed.push(ch);
    }
    if collapsed.is_empty() {
        collapsed.push('/');
    }

    if let Some(port) = port {
        if Some(port) != default_port {
            host.push(':');
            host.push_str(&port.to_string());
        }
    }

    NormalizedUrl {
        host,
        path: collapsed,
    }
}

/// Normalized key of the resource behind `handle`.
pub fn url_key(handle: &Handle) -> String {
    normalize_url(
        &handle.host(),
        handle.port(),
        handle.url_type().default_port(),
        &handle.path(PathVariant::Path),
    )
    .key()
}

#[cfg(test)]
mod tests {
    use super::NormalizedUrl;
    use super::normalize_url;
    use pretty_assertions::assert_eq;

    #[test]
    fn applies_every_step() {
        let normalized = normalize_url("WWW.Example.COM..", Some(8080), Some(80), "/A//b///C?q=1#top");
        assert_eq!(
            normalized,
            NormalizedUrl {
                host: "www.example.com:8080".to_owned(),
                path: "/a/b/c".to_owned(),
            }
        );
        assert_eq!(normalized.key(), "www.example.com:8080/a/b/c");
    }

    #[test]
    fn default_port_and_empty_path() {
        let normalized = normalize_url("example.com", Some(443), Some(443), "");
        assert_eq!(normalized.key(), "example.com/");

        let fragment_only = normalize_url("example.com", None, Some(80), "#frag");
        assert_eq!(fragment_only.path, "/");
    }

    #[test]
    fn normalizing_twice_changes_nothing() {
        let inputs = [
            ("Example.com.", "/Path//To/?x=1"),
            ("a.b.c", "//"),
            ("HOST", "/already/normal"),
            ("host..", "/x#y?z"),
        ];
        for (host, path) in inputs {
            let once = normalize_url(host, None, None, path);
            let twice = normalize_url(&once.host, None, None, &once.path);
            assert_eq!(once, twice, "input {host} {path}");
        }
    }
}
