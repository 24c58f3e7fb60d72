//! Cache policy header side effects and expiry decisions.

use crate::attr::Slot;
use crate::attr::StrAttr;
use crate::attr::UintAttr;
use crate::attr::ValueAttr;
use crate::rep::RepState;
use carta_core::CartaError;
use carta_core::CartaResult;
use serde::Deserialize;
use serde::Serialize;
use std::time::UNIX_EPOCH;

/// Staleness tolerance for responses without explicit freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckExpiry {
    /// Reuse cached content indefinitely.
    Never,
    /// Revalidate on every load.
    Always,
    /// Reuse for this many seconds after loading.
    After(u64),
}

/// Inputs to [`is_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryCheck {
    pub inline: bool,
    /// Ignore server freshness and use only the configured policy.
    pub user_setting_only: bool,
    /// Extra staleness a caller accepts past the server expiry.
    pub max_stale: Option<u64>,
    /// Upper bound on age a caller accepts regardless of the server.
    pub max_age: Option<u64>,
}

impl ExpiryCheck {
    pub fn document() -> Self {
        Self {
            inline: false,
            user_setting_only: false,
            max_stale: None,
            max_age: None,
        }
    }

    pub fn inline() -> Self {
        Self {
            inline: true,
            ..Self::document()
        }
    }
}

/// Seconds since the epoch of an HTTP date.
pub fn parse_http_time(value: &str) -> Option<u64> {
    httpdate::parse_http_date(value.trim())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
}

fn loaded_at(state: &RepState, now: u64) -> u64 {
    match state.attrs.value(ValueAttr::LocalTimeLoaded) {
        0 => now,
        loaded => loaded,
    }
}

pub(crate) fn apply_cache_control(
    state: &mut RepState,
    value: &str,
    now: u64,
    https_get: bool,
) -> CartaResult<()> {
    for directive in value.split(',') {
        let (name, argument) = match directive.split_once('=') {
            Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
            None => (directive.trim(), None),
        };

        match name.to_ascii_lowercase().as_str() {
            "no-cache" => state.attrs.set_flag(UintAttr::CachePolicyAlwaysVerify, true)?,
            "no-store" => state.attrs.set_flag(UintAttr::CachePolicyNoStore, true)?,
            "must-revalidate" if https_get => {
                state.attrs.set_flag(UintAttr::CachePolicyMustRevalidate, true)?;
            }
            "max-age" => {
                let Some(seconds) = argument.and_then(|raw| raw.parse::<u64>().ok()) else {
                    continue;
                };
                if seconds == 0 {
                    state.attrs.set_flag(UintAttr::CachePolicyAlwaysVerify, true)?;
                } else if !state.max_age_set {
                    let age = state.attrs.value(ValueAttr::HttpAgeSeconds);
                    let expires = loaded_at(state, now)
                        .saturating_add(seconds)
                        .saturating_sub(age);
                    state.attrs.set_value(ValueAttr::ExpirationTime, expires.max(1))?;
                    state.max_age_set = true;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

pub(crate) fn apply_pragma(state: &mut RepState, value: &str) -> CartaResult<()> {
    let no_cache = value
        .split(',')
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"));
    if no_cache {
        state.attrs.set_flag(UintAttr::CachePolicyAlwaysVerify, true)?;
    }
    Ok(())
}

/// `Expires` is converted to a lifetime relative to `Date` so a skewed
/// server clock does not shift it. A max-age expiry wins.
pub(crate) fn apply_expires(state: &mut RepState, value: &str, now: u64) -> CartaResult<()> {
    if state.max_age_set {
        return Ok(());
    }

    let Some(expires) = parse_http_time(value) else {
        // Unparseable dates mean "already expired".
        return state.attrs.set_flag(UintAttr::CachePolicyAlwaysVerify, true);
    };

    let loaded = loaded_at(state, now);
    let date = match state.attrs.value(ValueAttr::HttpDateTime) {
        0 => loaded,
        date => date,
    };
    if expires <= date {
        return state.attrs.set_flag(UintAttr::CachePolicyAlwaysVerify, true);
    }

    let lifetime = expires - date;
    state
        .attrs
        .set_value(ValueAttr::ExpirationTime, loaded.saturating_add(lifetime))
}

pub(crate) fn apply_age(state: &mut RepState, value: &str, now: u64) -> CartaResult<()> {
    let age = value.trim().parse::<u64>().map_err(|_| {
        CartaError::parse("url.cache.age_invalid", format!("`{value}` is not an age"))
    })?;

    let loaded = loaded_at(state, now);
    let apparent = match state.attrs.value(ValueAttr::HttpDateTime) {
        0 => 0,
        date => now.saturating_sub(date),
    };
    let current = apparent.max(age).saturating_add(now.saturating_sub(loaded));
    state.attrs.set_value(ValueAttr::HttpAgeSeconds, current)
}

pub(crate) fn apply_date(state: &mut RepState, value: &str) -> CartaResult<()> {
    let Some(date) = parse_http_time(value) else {
        return Err(CartaError::parse(
            "url.cache.date_invalid",
            format!("`{value}` is not an HTTP date"),
        ));
    };
    state.attrs.set_value(ValueAttr::HttpDateTime, date)
}

/// Decides whether cached content must be fetched again.
pub(crate) fn is_expired(
    state: &RepState,
    now: u64,
    check: ExpiryCheck,
    document_policy: CheckExpiry,
    inline_policy: CheckExpiry,
) -> bool {
    if state.attrs.flag(UintAttr::IsGeneratedDocument) {
        return false;
    }

    let loaded = state.attrs.value(ValueAttr::LocalTimeLoaded);
    if let Some(max_age) = check.max_age {
        if now.saturating_sub(loaded) > max_age {
            return true;
        }
    }

    if !check.user_setting_only {
        if state.attrs.flag(UintAttr::CachePolicyNoStore)
            || state.attrs.flag(UintAttr::CachePolicyAlwaysVerify)
        {
            return true;
        }

        let expires = state.attrs.value(ValueAttr::ExpirationTime);
        if expires != 0 {
            let limit = expires.saturating_add(check.max_stale.unwrap_or(0));
            return now > limit;
        }
    }

    let policy = if check.inline {
        inline_policy
    } else {
        document_policy
    };
    match policy {
        CheckExpiry::Never => false,
        CheckExpiry::Always => true,
        CheckExpiry::After(seconds) => now >= loaded.saturating_add(seconds),
    }
}

/// Validators for a conditional request: `(etag, last_modified)`.
pub(crate) fn validators(state: &RepState) -> (Option<String>, Option<String>) {
    let read = |attr| {
        let value = state.attrs.string(Slot::Fixed(attr));
        (!value.is_empty()).then(|| value.to_owned())
    };
    (
        read(StrAttr::HttpEtag),
        read(StrAttr::HttpLastModified),
    )
}

#[cfg(test)]
mod tests {
    use super::CheckExpiry;
    use super::ExpiryCheck;
    use super::apply_age;
    use super::apply_cache_control;
    use super::apply_date;
    use super::apply_expires;
    use super::apply_pragma;
    use super::is_expired;
    use super::parse_http_time;
    use crate::attr::UintAttr;
    use crate::attr::ValueAttr;
    use crate::rep::RepState;

    const DOC: CheckExpiry = CheckExpiry::After(300);
    const INLINE: CheckExpiry = CheckExpiry::After(3600);

    fn loaded_state(at: u64) -> RepState {
        let mut state = RepState::default();
        assert!(state.attrs.set_value(ValueAttr::LocalTimeLoaded, at).is_ok());
        state
    }

    #[test]
    fn max_age_sets_expiry_once() {
        let mut state = loaded_state(1_000);
        assert!(apply_cache_control(&mut state, "public, max-age=60", 1_000, false).is_ok());
        assert_eq!(state.attrs.value(ValueAttr::ExpirationTime), 1_060);
        assert!(apply_cache_control(&mut state, "max-age=600", 1_000, false).is_ok());
        assert_eq!(state.attrs.value(ValueAttr::ExpirationTime), 1_060);
        assert!(!is_expired(&state, 1_050, ExpiryCheck::document(), DOC, INLINE));
        assert!(is_expired(&state, 1_061, ExpiryCheck::document(), DOC, INLINE));
    }

    #[test]
    fn zero_max_age_and_no_cache_force_revalidation() {
        let mut state = loaded_state(1_000);
        assert!(apply_cache_control(&mut state, "max-age=0", 1_000, false).is_ok());
        assert!(state.attrs.flag(UintAttr::CachePolicyAlwaysVerify));

        let mut state = loaded_state(1_000);
        assert!(apply_pragma(&mut state, "no-cache").is_ok());
        assert!(is_expired(&state, 1_000, ExpiryCheck::document(), DOC, INLINE));
    }

    #[test]
    fn must_revalidate_only_for_https_get() {
        let mut state = loaded_state(1_000);
        assert!(apply_cache_control(&mut state, "must-revalidate", 1_000, false).is_ok());
        assert!(!state.attrs.flag(UintAttr::CachePolicyMustRevalidate));
        assert!(apply_cache_control(&mut state, "must-revalidate", 1_000, true).is_ok());
        assert!(state.attrs.flag(UintAttr::CachePolicyMustRevalidate));
    }

    #[test]
    fn expires_is_relative_to_date() {
        let mut state = loaded_state(5_000);
        // Server clock runs 4000 seconds behind.
        let date = "Thu, 01 Jan 1970 00:16:40 GMT";
        let expires = "Thu, 01 Jan 1970 00:18:20 GMT";
        assert_eq!(parse_http_time(date), Some(1_000));
        assert!(apply_date(&mut state, date).is_ok());
        assert!(apply_expires(&mut state, expires, 5_000).is_ok());
        assert_eq!(state.attrs.value(ValueAttr::ExpirationTime), 5_100);
    }

    #[test]
    fn expires_does_not_override_max_age() {
        let mut state = loaded_state(1_000);
        assert!(apply_cache_control(&mut state, "max-age=10", 1_000, false).is_ok());
        assert!(apply_expires(&mut state, "Sun, 06 Nov 1994 08:49:37 GMT", 1_000).is_ok());
        assert_eq!(state.attrs.value(ValueAttr::ExpirationTime), 1_010);
        assert!(!state.attrs.flag(UintAttr::CachePolicyAlwaysVerify));
    }

    #[test]
    fn age_takes_the_larger_estimate() {
        let mut state = loaded_state(1_000);
        assert!(apply_date(&mut state, "Thu, 01 Jan 1970 00:16:30 GMT").is_ok());
        assert!(apply_age(&mut state, "3", 1_000).is_ok());
        assert_eq!(state.attrs.value(ValueAttr::HttpAgeSeconds), 10);
        assert!(apply_age(&mut state, "x", 1_000).is_err());
    }

    #[test]
    fn policy_applies_without_server_freshness() {
        let state = loaded_state(1_000);
        assert!(!is_expired(&state, 1_299, ExpiryCheck::document(), DOC, INLINE));
        assert!(is_expired(&state, 1_300, ExpiryCheck::document(), DOC, INLINE));
        assert!(!is_expired(&state, 1_300, ExpiryCheck::inline(), DOC, INLINE));

        let check = ExpiryCheck {
            max_age: Some(10),
            ..ExpiryCheck::inline()
        };
        assert!(is_expired(&state, 1_011, check, DOC, INLINE));
    }

    #[test]
    fn generated_documents_never_expire() {
        let mut state = loaded_state(1_000);
        assert!(state.attrs.set_flag(UintAttr::IsGeneratedDocument, true).is_ok());
        assert!(state.attrs.set_flag(UintAttr::CachePolicyNoStore, true).is_ok());
        assert!(!is_expired(&state, 99_999, ExpiryCheck::document(), CheckExpiry::Always, INLINE));
    }
}
