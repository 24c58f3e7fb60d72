//! Attribute keys and the per-resource attribute table.
//!
//! Every space reads as its default when a key was never set: `0`, the empty
//! string, or an empty [`Handle`].

use crate::handle::Handle;
use carta_core::CartaError;
use carta_core::CartaResult;
use carta_core::try_owned_string;
use std::collections::HashMap;
use std::hash::Hash;

/// Unsigned integer and flag attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UintAttr {
    /// [`crate::LoadStatus`] as a number. Read-only.
    LoadStatus,
    /// [`crate::ContentType`] as a number.
    ContentType,
    /// Charset id, see [`crate::content::charset_id`].
    Charset,
    /// [`carta_storage::CacheType`] as a number.
    CacheType,
    /// [`carta_security::SecurityLevel`] as a number.
    SecurityStatus,
    /// Rating cached on the host. Read-only.
    TrustRating,
    /// Set once the resource was made unique. Read-only.
    IsUnique,
    /// Set once response headers arrived for the current load. Read-only.
    HeaderLoaded,
    HttpResponseCode,
    /// [`carta_net::HttpMethod`] as a number.
    HttpMethod,
    ResumeSupported,
    IsResuming,
    CachePolicyAlwaysVerify,
    CachePolicyNoStore,
    CachePolicyMustRevalidate,
    IsThirdParty,
    IsThirdPartyReach,
    DisableCookies,
    BlockUserInteraction,
    SkipContentBlocker,
    BypassProxy,
    UserInitiated,
    /// Set on a redirect target reached by following a redirect.
    IsFollowed,
    IsGeneratedDocument,
    IsClickThroughPage,
    IsMultipart,
    RedirectCount,
    /// Whole-load limit in seconds; zero disables it.
    MaxDurationSecs,
    /// Limit on silence between transfer events in seconds; zero disables it.
    IdleTimeoutSecs,
}

impl UintAttr {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadStatus => "load_status",
            Self::ContentType => "content_type",
            Self::Charset => "charset",
            Self::CacheType => "cache_type",
            Self::SecurityStatus => "security_status",
            Self::TrustRating => "trust_rating",
            Self::IsUnique => "is_unique",
            Self::HeaderLoaded => "header_loaded",
            Self::HttpResponseCode => "http_response_code",
            Self::HttpMethod => "http_method",
            Self::ResumeSupported => "resume_supported",
            Self::IsResuming => "is_resuming",
            Self::CachePolicyAlwaysVerify => "cache_policy_always_verify",
            Self::CachePolicyNoStore => "cache_policy_no_store",
            Self::CachePolicyMustRevalidate => "cache_policy_must_revalidate",
            Self::IsThirdParty => "is_third_party",
            Self::IsThirdPartyReach => "is_third_party_reach",
            Self::DisableCookies => "disable_cookies",
            Self::BlockUserInteraction => "block_user_interaction",
            Self::SkipContentBlocker => "skip_content_blocker",
            Self::BypassProxy => "bypass_proxy",
            Self::UserInitiated => "user_initiated",
            Self::IsFollowed => "is_followed",
            Self::IsGeneratedDocument => "is_generated_document",
            Self::IsClickThroughPage => "is_click_through_page",
            Self::IsMultipart => "is_multipart",
            Self::RedirectCount => "redirect_count",
            Self::MaxDurationSecs => "max_duration_secs",
            Self::IdleTimeoutSecs => "idle_timeout_secs",
        }
    }

    /// Inclusive range of accepted values, `None` for any `u32`.
    pub fn range(self) -> Option<(u32, u32)> {
        match self {
            Self::ContentType => Some((0, 16)),
            Self::CacheType => Some((0, 4)),
            Self::SecurityStatus => Some((0, 4)),
            Self::HttpMethod => Some((0, 6)),
            Self::HttpResponseCode => Some((0, 999)),
            Self::ResumeSupported
            | Self::IsResuming
            | Self::CachePolicyAlwaysVerify
            | Self::CachePolicyNoStore
            | Self::CachePolicyMustRevalidate
            | Self::IsThirdParty
            | Self::IsThirdPartyReach
            | Self::DisableCookies
            | Self::BlockUserInteraction
            | Self::SkipContentBlocker
            | Self::BypassProxy
            | Self::UserInitiated
            | Self::IsFollowed
            | Self::IsGeneratedDocument
            | Self::IsClickThroughPage
            | Self::IsMultipart => Some((0, 1)),
            _ => None,
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::LoadStatus | Self::TrustRating | Self::IsUnique | Self::HeaderLoaded
        )
    }

    /// Attributes that only mean something for `http:` and `https:`.
    pub fn is_http_only(self) -> bool {
        matches!(
            self,
            Self::HttpResponseCode | Self::HttpMethod | Self::CachePolicyMustRevalidate
        )
    }
}

/// String attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrAttr {
    /// Host name. Read-only.
    ServerName,
    /// MIME type without parameters.
    MimeType,
    /// Charset label used for the body.
    CharsetName,
    Title,
    SuggestedFilename,
    /// Body sent with POST and PUT.
    FormRequest,
    HttpEtag,
    HttpLastModified,
    HttpContentLanguage,
    HttpContentDisposition,
    HttpContentEncoding,
    HttpLocation,
    HttpRefresh,
    HttpResponseText,
    /// Raw `Content-Type` as received.
    HttpContentType,
    /// Special method name, must be a token.
    HttpSpecialMethod,
    /// Set-only: applies `Cache-Control` directives.
    HttpCacheControl,
    /// Set-only: applies `Pragma` directives.
    HttpPragma,
    /// Set-only: applies an `Expires` date.
    HttpExpires,
    /// Set-only: applies an `Age` value.
    HttpAgeHeader,
    /// Set-only: records the `Date` header.
    HttpDateHeader,
    /// Set-only: overrides the content type from a MIME type.
    MimeForceContentType,
}

impl StrAttr {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerName => "server_name",
            Self::MimeType => "mime_type",
            Self::CharsetName => "charset_name",
            Self::Title => "title",
            Self::SuggestedFilename => "suggested_filename",
            Self::FormRequest => "form_request",
            Self::HttpEtag => "http_etag",
            Self::HttpLastModified => "http_last_modified",
            Self::HttpContentLanguage => "http_content_language",
            Self::HttpContentDisposition => "http_content_disposition",
            Self::HttpContentEncoding => "http_content_encoding",
            Self::HttpLocation => "http_location",
            Self::HttpRefresh => "http_refresh",
            Self::HttpResponseText => "http_response_text",
            Self::HttpContentType => "http_content_type",
            Self::HttpSpecialMethod => "http_special_method",
            Self::HttpCacheControl => "http_cache_control",
            Self::HttpPragma => "http_pragma",
            Self::HttpExpires => "http_expires",
            Self::HttpAgeHeader => "http_age_header",
            Self::HttpDateHeader => "http_date_header",
            Self::MimeForceContentType => "mime_force_content_type",
        }
    }

    /// Keys that trigger a side effect and keep no value of their own.
    pub fn is_set_only(self) -> bool {
        matches!(
            self,
            Self::HttpCacheControl
                | Self::HttpPragma
                | Self::HttpExpires
                | Self::HttpAgeHeader
                | Self::HttpDateHeader
                | Self::MimeForceContentType
        )
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ServerName)
    }

    pub fn is_http_only(self) -> bool {
        matches!(
            self,
            Self::HttpEtag
                | Self::HttpLastModified
                | Self::HttpContentLanguage
                | Self::HttpContentDisposition
                | Self::HttpContentEncoding
                | Self::HttpLocation
                | Self::HttpRefresh
                | Self::HttpResponseText
                | Self::HttpContentType
                | Self::HttpSpecialMethod
                | Self::HttpCacheControl
                | Self::HttpPragma
                | Self::HttpExpires
                | Self::HttpAgeHeader
                | Self::HttpDateHeader
        )
    }
}

/// Wide numeric attributes: times in seconds since the epoch and sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueAttr {
    LocalTimeLoaded,
    LocalTimeVisited,
    /// Absolute expiry; zero means none was set.
    ExpirationTime,
    /// Expected body size, zero when unknown.
    ContentSize,
    /// Bytes loaded so far. Read-only.
    ContentLoaded,
    /// Server `Date`.
    HttpDateTime,
    /// Current age of the cached response.
    HttpAgeSeconds,
}

impl ValueAttr {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalTimeLoaded => "local_time_loaded",
            Self::LocalTimeVisited => "local_time_visited",
            Self::ExpirationTime => "expiration_time",
            Self::ContentSize => "content_size",
            Self::ContentLoaded => "content_loaded",
            Self::HttpDateTime => "http_date_time",
            Self::HttpAgeSeconds => "http_age_seconds",
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ContentLoaded)
    }
}

/// Attributes holding a reference to another resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlAttr {
    /// Redirect target. Follow it with [`crate::Redirect::Follow`].
    MovedTo,
    ContentLocation,
    Referrer,
    Alias,
    BaseAlias,
    Fallback,
    /// On a fraud warning page: the blocked resource.
    BlockedUrl,
}

impl UrlAttr {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MovedTo => "moved_to",
            Self::ContentLocation => "content_location",
            Self::Referrer => "referrer",
            Self::Alias => "alias",
            Self::BaseAlias => "base_alias",
            Self::Fallback => "fallback",
            Self::BlockedUrl => "blocked_url",
        }
    }
}

/// Value space of a runtime-registered attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DynamicKind {
    Uint,
    Str,
    Url,
}

/// Key of a runtime-registered attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicAttr {
    id: u32,
    kind: DynamicKind,
}

impl DynamicAttr {
    pub fn id(self) -> u32 {
        self.id
    }

    pub fn kind(self) -> DynamicKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
struct DynamicEntry {
    name: String,
    attr: DynamicAttr,
}

/// Names and ids of runtime-registered attributes.
#[derive(Debug, Clone, Default)]
pub struct DynamicRegistry {
    entries: Vec<DynamicEntry>,
}

impl DynamicRegistry {
    /// Registers `name`, or returns the existing key when the name and kind
    /// were registered before.
    pub fn register(&mut self, name: &str, kind: DynamicKind) -> CartaResult<DynamicAttr> {
        if let Some(entry) = self.entries.iter().find(|entry| entry.name == name) {
            if entry.attr.kind != kind {
                return Err(CartaError::invalid_state(
                    "url.attr.dynamic_kind_mismatch",
                    format!("dynamic attribute `{name}` is registered with another kind"),
                ));
            }
            return Ok(entry.attr);
        }

        self.entries.try_reserve(1).map_err(|error| {
            CartaError::out_of_memory("url.attr.out_of_memory", error.to_string())
        })?;
        let attr = DynamicAttr {
            id: self.entries.len() as u32 + 1,
            kind,
        };
        self.entries.push(DynamicEntry {
            name: try_owned_string(name, "url.attr.out_of_memory")?,
            attr,
        });
        Ok(attr)
    }

    pub fn find(&self, name: &str) -> Option<DynamicAttr> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.attr)
    }

    pub fn name(&self, attr: DynamicAttr) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.attr == attr)
            .map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fixed or runtime-registered key inside one value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Slot<A> {
    Fixed(A),
    Dynamic(u32),
}

/// Sparse attribute table of one resource.
#[derive(Debug, Clone, Default)]
pub(crate) struct AttributeStore {
    uints: HashMap<Slot<UintAttr>, u32>,
    strings: HashMap<Slot<StrAttr>, String>,
    values: HashMap<ValueAttr, u64>,
    urls: HashMap<Slot<UrlAttr>, Handle>,
}

fn reserve_one<K: Eq + Hash, V>(map: &mut HashMap<K, V>) -> CartaResult<()> {
    map.try_reserve(1)
        .map_err(|error| CartaError::out_of_memory("url.attr.out_of_memory", error.to_string()))
}

impl AttributeStore {
    pub fn uint(&self, slot: Slot<UintAttr>) -> u32 {
        self.uints.get(&slot).copied().unwrap_or(0)
    }

    pub fn flag(&self, attr: UintAttr) -> bool {
        self.uint(Slot::Fixed(attr)) != 0
    }

    pub fn set_uint(&mut self, slot: Slot<UintAttr>, value: u32) -> CartaResult<()> {
        if value == 0 {
            self.uints.remove(&slot);
            return Ok(());
        }
        reserve_one(&mut self.uints)?;
        self.uints.insert(slot, value);
        Ok(())
    }

    pub fn set_flag(&mut self, attr: UintAttr, value: bool) -> CartaResult<()> {
        self.set_uint(Slot::Fixed(attr), u32::from(value))
    }

    pub fn string(&self, slot: Slot<StrAttr>) -> &str {
        self.strings.get(&slot).map_or("", String::as_str)
    }

    /// Stores a copy of `value`. On failure the previous value is kept.
    pub fn set_string(&mut self, slot: Slot<StrAttr>, value: &str) -> CartaResult<()> {
        if value.is_empty() {
            self.strings.remove(&slot);
            return Ok(());
        }
        let owned = try_owned_string(value, "url.attr.out_of_memory")?;
        reserve_one(&mut self.strings)?;
        self.strings.insert(slot, owned);
        Ok(())
    }

    pub fn value(&self, attr: ValueAttr) -> u64 {
        self.values.get(&attr).copied().unwrap_or(0)
    }

    pub fn set_value(&mut self, attr: ValueAttr, value: u64) -> CartaResult<()> {
        if value == 0 {
            self.values.remove(&attr);
            return Ok(());
        }
        reserve_one(&mut self.values)?;
        self.values.insert(attr, value);
        Ok(())
    }

    pub fn url(&self, slot: Slot<UrlAttr>) -> Handle {
        self.urls.get(&slot).cloned().unwrap_or_default()
    }

    pub fn set_url(&mut self, slot: Slot<UrlAttr>, handle: Handle) -> CartaResult<()> {
        if handle.is_empty() {
            self.urls.remove(&slot);
            return Ok(());
        }
        reserve_one(&mut self.urls)?;
        self.urls.insert(slot, handle);
        Ok(())
    }

    /// Drops response-derived state before a new load.
    pub fn clear_response(&mut self) {
        for attr in [
            UintAttr::HttpResponseCode,
            UintAttr::CachePolicyAlwaysVerify,
            UintAttr::CachePolicyNoStore,
            UintAttr::CachePolicyMustRevalidate,
            UintAttr::IsMultipart,
        ] {
            self.uints.remove(&Slot::Fixed(attr));
        }
        for attr in [
            StrAttr::HttpLocation,
            StrAttr::HttpRefresh,
            StrAttr::HttpResponseText,
            StrAttr::HttpContentDisposition,
            StrAttr::HttpContentLanguage,
            StrAttr::HttpContentEncoding,
        ] {
            self.strings.remove(&Slot::Fixed(attr));
        }
        for attr in [ValueAttr::ExpirationTime, ValueAttr::HttpAgeSeconds, ValueAttr::ContentSize] {
            self.values.remove(&attr);
        }
    }

    /// Drops references to other resources so chains can be released.
    pub fn clear_urls(&mut self) {
        self.urls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::AttributeStore;
    use super::DynamicKind;
    use super::DynamicRegistry;
    use super::Slot;
    use super::StrAttr;
    use super::UintAttr;
    use super::UrlAttr;
    use super::ValueAttr;

    #[test]
    fn absent_attributes_read_as_defaults() {
        let store = AttributeStore::default();
        assert_eq!(store.uint(Slot::Fixed(UintAttr::HttpResponseCode)), 0);
        assert_eq!(store.string(Slot::Fixed(StrAttr::HttpEtag)), "");
        assert_eq!(store.value(ValueAttr::ExpirationTime), 0);
        assert!(store.url(Slot::Fixed(UrlAttr::MovedTo)).is_empty());
        assert_eq!(store.uint(Slot::Dynamic(42)), 0);
    }

    #[test]
    fn clearing_response_keeps_request_state() {
        let mut store = AttributeStore::default();
        assert!(store.set_uint(Slot::Fixed(UintAttr::HttpResponseCode), 200).is_ok());
        assert!(store.set_flag(UintAttr::DisableCookies, true).is_ok());
        assert!(store.set_string(Slot::Fixed(StrAttr::HttpLocation), "/x").is_ok());
        store.clear_response();
        assert_eq!(store.uint(Slot::Fixed(UintAttr::HttpResponseCode)), 0);
        assert!(store.flag(UintAttr::DisableCookies));
        assert_eq!(store.string(Slot::Fixed(StrAttr::HttpLocation)), "");
    }

    #[test]
    fn dynamic_registration_is_idempotent_per_name() {
        let mut registry = DynamicRegistry::default();
        let first = registry.register("x-trace", DynamicKind::Str);
        let again = registry.register("x-trace", DynamicKind::Str);
        let clash = registry.register("x-trace", DynamicKind::Uint);
        match (first, again) {
            (Ok(first), Ok(again)) => assert_eq!(first, again),
            _ => panic!("registration failed"),
        }
        match clash {
            Err(error) => assert_eq!(error.code, "url.attr.dynamic_kind_mismatch"),
            Ok(_) => panic!("kind clash accepted"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ranges_cover_flags() {
        assert_eq!(UintAttr::IsThirdParty.range(), Some((0, 1)));
        assert_eq!(UintAttr::MaxDurationSecs.range(), None);
        assert!(UintAttr::LoadStatus.is_read_only());
        assert!(StrAttr::HttpCacheControl.is_set_only());
    }
}
